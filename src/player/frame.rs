use ffmpeg_next as ffmpeg;
use std::sync::Arc;

/// 解复用出的压缩数据包。Arc 共享，克隆零拷贝。
#[derive(Clone)]
pub struct Packet {
    inner: Arc<PacketInner>,
}

struct PacketInner {
    packet: ffmpeg::Packet,
    stream_index: usize,
    pts_us: Option<i64>,
    duration_us: i64,
}

// 包数据在构造后只读，跨线程共享是安全的
unsafe impl Send for PacketInner {}
unsafe impl Sync for PacketInner {}

impl Packet {
    pub fn new(
        packet: ffmpeg::Packet,
        stream_index: usize,
        pts_us: Option<i64>,
        duration_us: i64,
    ) -> Self {
        Self {
            inner: Arc::new(PacketInner {
                packet,
                stream_index,
                pts_us,
                duration_us,
            }),
        }
    }

    pub fn avpacket(&self) -> &ffmpeg::Packet {
        &self.inner.packet
    }

    pub fn stream_index(&self) -> usize {
        self.inner.stream_index
    }

    pub fn pts_us(&self) -> Option<i64> {
        self.inner.pts_us
    }

    pub fn duration_us(&self) -> i64 {
        self.inner.duration_us
    }

    /// 压缩数据字节数（背压统计用）
    pub fn size(&self) -> usize {
        self.inner.packet.size()
    }
}

/// 解码后的帧内容
pub enum FramePayload {
    Video(ffmpeg::frame::Video),
    Audio(ffmpeg::frame::Audio),
    /// 已展平的字幕文本（可为多行）
    Subtitle(String),
}

/// 解码后的帧。Arc 共享、构造后不可变，渲染器按 payload 分派。
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

struct FrameInner {
    payload: FramePayload,
    pts_us: i64,
    duration_us: i64,
}

// 帧数据在构造后只读
unsafe impl Send for FrameInner {}
unsafe impl Sync for FrameInner {}

impl Frame {
    pub fn new(payload: FramePayload, pts_us: i64, duration_us: i64) -> Self {
        Self {
            inner: Arc::new(FrameInner {
                payload,
                pts_us,
                duration_us,
            }),
        }
    }

    pub fn payload(&self) -> &FramePayload {
        &self.inner.payload
    }

    pub fn pts_us(&self) -> i64 {
        self.inner.pts_us
    }

    pub fn duration_us(&self) -> i64 {
        self.inner.duration_us
    }

    /// 结束展示的时间点
    pub fn end_us(&self) -> i64 {
        self.inner.pts_us + self.inner.duration_us
    }
}

#[cfg(test)]
pub(crate) fn subtitle_frame(text: &str, pts_us: i64, duration_us: i64) -> Frame {
    Frame::new(FramePayload::Subtitle(text.to_string()), pts_us, duration_us)
}
