use crate::core::TrackType;
use crate::player::codec::{Codec, CodecContext, CodecInfo};
use crate::player::frame::{Frame, FramePayload, Packet};
use crate::player::queue::{
    FrameQueue, PacketQueue, AUDIO_FRAME_QUEUE_DEPTH, VIDEO_FRAME_QUEUE_DEPTH,
};
use crate::player::worker::{Worker, WorkerControl, WorkerHandle};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::util;
use log::{debug, warn};
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 流解码器与解复用器/渲染器共享的状态。
/// 包队列由解复用线程喂入，帧队列由渲染线程消费。
pub struct StreamDecoderShared {
    info: Arc<CodecInfo>,
    packet_queue: PacketQueue,
    frame_queue: FrameQueue,
    /// 解码线程自己的控制句柄
    control: Arc<WorkerControl>,
    /// 消费包后唤醒解复用线程（解除背压）
    demuxer_control: Arc<WorkerControl>,
    /// 连接的渲染线程，出帧后唤醒
    renderer_control: Mutex<Option<Arc<WorkerControl>>>,
    /// 解码器已排空（EOS 哨兵消费完毕且内部缓冲吐尽）
    eos: AtomicBool,
    /// 跳转后待执行的解码器状态重置
    flush_requested: AtomicBool,
}

impl StreamDecoderShared {
    pub fn info(&self) -> &Arc<CodecInfo> {
        &self.info
    }

    pub fn track_type(&self) -> TrackType {
        self.info.track_type()
    }

    /// 解复用线程喂入一个压缩包
    pub fn push_packet(&self, packet: Packet) {
        self.packet_queue.push(packet);
        self.control.wake();
    }

    /// 流结束哨兵
    pub fn push_eos(&self) {
        self.packet_queue.push_eos();
        self.control.wake();
    }

    /// 清空两级队列并要求解码线程重置解码器状态（跳转）。
    /// 解码器状态只由解码线程自己动，这里只竖标记。
    pub fn begin_flush(&self) {
        self.packet_queue.clear();
        self.frame_queue.clear();
        self.eos.store(false, Ordering::SeqCst);
        self.flush_requested.store(true, Ordering::SeqCst);
        self.control.wake();
        self.wake_renderer();
    }

    /// 解码线程消费重置标记。排空分支可能在 begin_flush 之后
    /// 才落下 eos，这里一并清掉，否则该流会永久报告播完。
    fn take_flush_request(&self) -> bool {
        if self.flush_requested.swap(false, Ordering::SeqCst) {
            self.eos.store(false, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn attach_renderer(&self, control: Arc<WorkerControl>) {
        *self.renderer_control.lock() = Some(control);
        self.control.wake();
    }

    pub fn detach_renderer(&self) {
        *self.renderer_control.lock() = None;
    }

    fn wake_renderer(&self) {
        if let Some(ctrl) = self.renderer_control.lock().as_ref() {
            ctrl.wake();
        }
    }

    /// 渲染器取帧
    pub fn take_frame(&self) -> Option<Frame> {
        let frame = self.frame_queue.take();
        if frame.is_some() {
            self.control.wake();
        }
        frame
    }

    /// 渲染器窥视下一帧（不消费）
    pub fn peek_frame(&self) -> Option<Frame> {
        self.frame_queue.peek()
    }

    /// 队首过期则弹出（字幕叠加用）
    pub fn pop_frame_if(&self, pred: impl FnOnce(&Frame) -> bool) -> Option<Frame> {
        let frame = self.frame_queue.pop_front_if(pred);
        if frame.is_some() {
            self.control.wake();
        }
        frame
    }

    /// 该流已全部解码且帧队列排空
    pub fn at_end(&self) -> bool {
        self.eos.load(Ordering::SeqCst) && self.frame_queue.is_empty()
    }

    pub fn packet_queue(&self) -> &PacketQueue {
        &self.packet_queue
    }

    fn take_packet(&self) -> Option<Packet> {
        let packet = self.packet_queue.take();
        if packet.is_some() {
            // 背压可能因此解除
            self.demuxer_control.wake();
        }
        packet
    }
}

/// 一条流的解码器：独占解码上下文的工作线程 + 共享队列
pub struct StreamDecoder {
    shared: Arc<StreamDecoderShared>,
    worker: WorkerHandle,
}

impl StreamDecoder {
    pub fn new(codec: Codec, demuxer_control: Arc<WorkerControl>) -> Self {
        let depth = match codec.info.track_type() {
            TrackType::Audio => AUDIO_FRAME_QUEUE_DEPTH,
            _ => VIDEO_FRAME_QUEUE_DEPTH,
        };
        let control = WorkerControl::new();
        let shared = Arc::new(StreamDecoderShared {
            info: codec.info.clone(),
            packet_queue: PacketQueue::new(),
            frame_queue: FrameQueue::new(depth),
            control: control.clone(),
            demuxer_control,
            renderer_control: Mutex::new(None),
            eos: AtomicBool::new(false),
            flush_requested: AtomicBool::new(false),
        });
        let worker = WorkerHandle::spawn_with(
            control,
            StreamDecoderWorker {
                shared: shared.clone(),
                codec,
                pending: None,
                sent_eof: false,
            },
        );
        Self { shared, worker }
    }

    pub fn shared(&self) -> &Arc<StreamDecoderShared> {
        &self.shared
    }

    pub fn begin_flush(&self) {
        self.shared.begin_flush();
    }

    pub fn kill(&mut self) {
        self.worker.kill();
    }
}

struct StreamDecoderWorker {
    shared: Arc<StreamDecoderShared>,
    codec: Codec,
    /// 解码器暂时拒收（EAGAIN）的包，下轮重喂，绝不丢弃
    pending: Option<Packet>,
    sent_eof: bool,
}

impl Worker for StreamDecoderWorker {
    fn name(&self) -> &'static str {
        match self.shared.track_type() {
            TrackType::Video => "video-decoder",
            TrackType::Audio => "audio-decoder",
            TrackType::Subtitle => "subtitle-decoder",
        }
    }

    fn should_wait(&self) -> bool {
        let shared = &self.shared;
        if shared.flush_requested.load(Ordering::SeqCst) {
            return false;
        }
        if shared.frame_queue.is_full() {
            return true;
        }
        if shared.eos.load(Ordering::SeqCst) {
            return true;
        }
        if self.sent_eof || self.pending.is_some() {
            // 还在排空解码器 / 有包待重喂
            return false;
        }
        shared.packet_queue.is_empty() && !shared.packet_queue.drained()
    }

    fn loop_once(&mut self, _control: &WorkerControl) -> Option<Duration> {
        if self.shared.take_flush_request() {
            self.codec.context.flush();
            self.pending = None;
            self.sent_eof = false;
            debug!("🧹 {} 已重置解码器状态", self.name());
            return None;
        }

        match &mut self.codec.context {
            CodecContext::Video(_) | CodecContext::Audio(_) => self.decode_step(),
            CodecContext::Subtitle(_) => self.subtitle_step(),
        }
        None
    }
}

impl StreamDecoderWorker {
    /// 音视频解码：先收帧再喂包。收帧优先保证解码器内部
    /// 缓冲尽快变成可渲染的帧。
    fn decode_step(&mut self) {
        let received = match &mut self.codec.context {
            CodecContext::Video(decoder) => {
                let mut frame = util::frame::Video::empty();
                match decoder.receive_frame(&mut frame) {
                    Ok(()) => ReceiveResult::Video(frame),
                    Err(e) => ReceiveResult::Err(e),
                }
            }
            CodecContext::Audio(decoder) => {
                let mut frame = util::frame::Audio::empty();
                match decoder.receive_frame(&mut frame) {
                    Ok(()) => ReceiveResult::Audio(frame),
                    Err(e) => ReceiveResult::Err(e),
                }
            }
            CodecContext::Subtitle(_) => unreachable!(),
        };

        match received {
            ReceiveResult::Video(frame) => self.emit_video(frame),
            ReceiveResult::Audio(frame) => self.emit_audio(frame),
            ReceiveResult::Err(ffmpeg::Error::Other { errno: 11 }) => self.feed(), // EAGAIN
            ReceiveResult::Err(ffmpeg::Error::Eof) => {
                debug!("📄 {} 解码器排空", self.name());
                self.shared.eos.store(true, Ordering::SeqCst);
                self.shared.wake_renderer();
            }
            ReceiveResult::Err(e) => {
                // 网络流中参考帧缺失等错误可容忍，跳过继续
                warn!("解码错误（已跳过）: {}", e);
            }
        }
    }

    fn emit_video(&mut self, frame: util::frame::Video) {
        let info = &self.shared.info;
        let Some(pts) = frame.pts().or_else(|| frame.timestamp()) else {
            debug!("丢弃无时间戳的视频帧");
            return;
        };
        let pts_us = info.to_us(pts);
        let duration_us = info.frame_duration_us().unwrap_or(0);
        self.shared
            .frame_queue
            .push(Frame::new(FramePayload::Video(frame), pts_us, duration_us));
        self.shared.wake_renderer();
    }

    fn emit_audio(&mut self, frame: util::frame::Audio) {
        let info = &self.shared.info;
        let Some(pts) = frame.pts().or_else(|| frame.timestamp()) else {
            debug!("丢弃无时间戳的音频帧");
            return;
        };
        let pts_us = info.to_us(pts);
        let duration_us = if frame.rate() > 0 {
            frame.samples() as i64 * 1_000_000 / frame.rate() as i64
        } else {
            0
        };
        self.shared
            .frame_queue
            .push(Frame::new(FramePayload::Audio(frame), pts_us, duration_us));
        self.shared.wake_renderer();
    }

    /// 向解码器喂下一个包；包队列排空且带 EOS 哨兵时转入排空阶段
    fn feed(&mut self) {
        let packet = self.pending.take().or_else(|| self.shared.take_packet());

        match packet {
            Some(packet) => {
                let result = match &mut self.codec.context {
                    CodecContext::Video(d) => d.send_packet(packet.avpacket()),
                    CodecContext::Audio(d) => d.send_packet(packet.avpacket()),
                    CodecContext::Subtitle(_) => unreachable!(),
                };
                match result {
                    Ok(()) => {}
                    Err(ffmpeg::Error::Other { errno: 11 }) => {
                        // 解码器暂时满，留着下轮重喂
                        self.pending = Some(packet);
                    }
                    Err(e) => {
                        warn!("送包失败（已丢弃该包）: {}", e);
                    }
                }
            }
            None => {
                if self.shared.packet_queue.drained() && !self.sent_eof {
                    let result = match &mut self.codec.context {
                        CodecContext::Video(d) => d.send_eof(),
                        CodecContext::Audio(d) => d.send_eof(),
                        CodecContext::Subtitle(_) => unreachable!(),
                    };
                    if let Err(e) = result {
                        warn!("send_eof 失败: {}", e);
                    }
                    self.sent_eof = true;
                }
            }
        }
    }

    /// 字幕是逐包解码，没有内部缓冲
    fn subtitle_step(&mut self) {
        if self.shared.packet_queue.drained() {
            if !self.shared.eos.swap(true, Ordering::SeqCst) {
                self.shared.wake_renderer();
            }
            return;
        }
        let Some(packet) = self.shared.take_packet() else {
            return;
        };

        let mut subtitle = ffmpeg::codec::subtitle::Subtitle::default();
        let decoded = match &mut self.codec.context {
            CodecContext::Subtitle(d) => d.decode(packet.avpacket(), &mut subtitle),
            _ => unreachable!(),
        };
        match decoded {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!("字幕解码失败（已跳过）: {}", e);
                return;
            }
        }

        let text = subtitle_text(&subtitle);

        // 时间戳优先用包上的，缺失时退回字幕自带的展示区间
        let (pts_us, duration_us) = match (packet.pts_us(), packet.duration_us()) {
            (Some(pts), d) if d > 0 => (Some(pts), d),
            (pts, _) => {
                let sub_pts = subtitle.pts().or(pts);
                let (start_ms, end_ms) = display_window_ms(&subtitle);
                match sub_pts {
                    Some(base) => (
                        Some(base + start_ms * 1000),
                        (end_ms - start_ms).max(0) * 1000,
                    ),
                    None => (None, 0),
                }
            }
        };

        // ✅ 必须释放 FFmpeg subtitle，否则泄漏
        unsafe {
            ffmpeg::ffi::avsubtitle_free(subtitle.as_mut_ptr());
        }

        let Some(pts_us) = pts_us else {
            debug!("丢弃无时间戳的字幕");
            return;
        };

        // 空文本也入队：它代表"清除当前字幕"的区间边界
        self.shared
            .frame_queue
            .push(Frame::new(FramePayload::Subtitle(text), pts_us, duration_us));
        self.shared.wake_renderer();
    }
}

enum ReceiveResult {
    Video(util::frame::Video),
    Audio(util::frame::Audio),
    Err(ffmpeg::Error),
}

/// 拼出一条字幕的纯文本（text 矩形直接取，ass 矩形剥掉事件头）
fn subtitle_text(subtitle: &ffmpeg::codec::subtitle::Subtitle) -> String {
    let mut out = String::new();
    for rect in subtitle.rects() {
        unsafe {
            let raw = rect.as_ptr();
            match (*raw).type_ {
                ffmpeg::ffi::AVSubtitleType::SUBTITLE_TEXT => {
                    if !(*raw).text.is_null() {
                        let s = CStr::from_ptr((*raw).text).to_string_lossy();
                        out.push_str(&normalize_subtitle_text(&s));
                    }
                }
                ffmpeg::ffi::AVSubtitleType::SUBTITLE_ASS => {
                    if !(*raw).ass.is_null() {
                        let s = CStr::from_ptr((*raw).ass).to_string_lossy();
                        out.push_str(&normalize_subtitle_text(ass_payload(&s)));
                    }
                }
                _ => {
                    // 位图字幕不支持
                    debug!("跳过位图字幕（仅支持文本字幕）");
                }
            }
        }
    }
    // 去掉矩形拼接留下的结尾换行
    while out.ends_with('\n') {
        out.pop();
    }
    out
}

/// 取 ASS 事件行的正文。完整 Dialogue 行带时间戳共 9 个逗号，
/// 新版 FFmpeg 的裸事件（ReadOrder 开头）是 8 个，正文都在最后。
fn ass_payload(line: &str) -> &str {
    let skip = if line.trim_start().starts_with("Dialogue:") {
        9
    } else {
        8
    };
    let mut commas = 0;
    for (i, b) in line.bytes().enumerate() {
        if b == b',' {
            commas += 1;
            if commas == skip {
                return &line[i + 1..];
            }
        }
    }
    line
}

/// 展平换行：`\N` / `\n` 字面量与 CRLF 统一成 `\n`
fn normalize_subtitle_text(text: &str) -> String {
    text.replace("\\N", "\n")
        .replace("\\n", "\n")
        .replace("\r\n", "\n")
        .replace('\r', "\n")
}

/// AVSubtitle 的展示区间（相对 pts 的毫秒偏移）
fn display_window_ms(subtitle: &ffmpeg::codec::subtitle::Subtitle) -> (i64, i64) {
    unsafe {
        let raw = subtitle.as_ptr();
        ((*raw).start_display_time as i64, (*raw).end_display_time as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ass_payload_skips_event_header() {
        // 裸事件（ReadOrder,Layer,Style,Name,MarginL,MarginR,MarginV,Effect,Text）
        let line = "1,0,Default,,0,0,0,,台词在这里";
        assert_eq!(ass_payload(line), "台词在这里");
        // 完整 Dialogue 行多出起止时间戳
        let line = "Dialogue: 0,0:00:01.00,0:00:03.00,Default,,0,0,0,,你好,世界";
        assert_eq!(ass_payload(line), "你好,世界");
    }

    #[test]
    fn normalize_flattens_newlines() {
        assert_eq!(normalize_subtitle_text("第一行\\N第二行"), "第一行\n第二行");
        assert_eq!(normalize_subtitle_text("a\\nb"), "a\nb");
        assert_eq!(normalize_subtitle_text("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn payload_keeps_commas_in_text() {
        let line = "9,0,Default,speaker,0,0,0,0,one, two, three";
        assert_eq!(ass_payload(line), "one, two, three");
    }

    fn video_shared() -> StreamDecoderShared {
        StreamDecoderShared {
            info: Arc::new(CodecInfo::new(
                0,
                TrackType::Video,
                ffmpeg::Rational::new(1, 90_000),
                None,
                "h264".into(),
                0,
            )),
            packet_queue: PacketQueue::new(),
            frame_queue: FrameQueue::new(VIDEO_FRAME_QUEUE_DEPTH),
            control: WorkerControl::new(),
            demuxer_control: WorkerControl::new(),
            renderer_control: Mutex::new(None),
            eos: AtomicBool::new(false),
            flush_requested: AtomicBool::new(false),
        }
    }

    #[test]
    fn flush_clears_eos_landed_while_draining() {
        let shared = video_shared();
        // 跳转落在解码线程的排空分支中间：begin_flush 先清 eos，
        // 排空分支随后又把它竖起来
        shared.begin_flush();
        shared.eos.store(true, Ordering::SeqCst);

        assert!(shared.take_flush_request());
        assert!(!shared.at_end(), "重置后不应再报告播完");
        // 标记已消费，不会重复重置
        assert!(!shared.take_flush_request());
    }

    #[test]
    fn flush_request_resets_queues() {
        let shared = video_shared();
        shared.push_eos();
        shared.begin_flush();
        assert!(!shared.at_end());
        assert!(shared.packet_queue.is_empty());
        assert!(shared.take_flush_request());
    }
}
