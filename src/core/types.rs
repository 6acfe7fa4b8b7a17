use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 轨道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackType {
    Video,
    Audio,
    Subtitle,
}

impl TrackType {
    pub const ALL: [TrackType; 3] = [TrackType::Video, TrackType::Audio, TrackType::Subtitle];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackType::Video => "video",
            TrackType::Audio => "audio",
            TrackType::Subtitle => "subtitle",
        }
    }
}

/// 色彩空间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorSpace {
    Bt601,
    Bt709,
    Bt2020,
    Unknown,
}

/// 传输特性（SDR / HDR）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorTransfer {
    Sdr,
    Pq,
    Hlg,
    Unknown,
}

/// 色彩范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorRange {
    Limited,
    Full,
    Unknown,
}

/// 交付给视频接收端的已解码帧（RGBA，CPU 内存）
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pts_us: i64,        // 显示时间戳（微秒）
    pub duration_us: i64,   // 帧持续时间（微秒）
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub line_size: usize,
    pub color_space: ColorSpace,
    pub color_transfer: ColorTransfer,
    pub color_range: ColorRange,
    /// 峰值亮度（尼特），仅 HDR 内容携带
    pub max_luminance: Option<f64>,
    /// 顺时针旋转角度（0/90/180/270）
    pub rotation: i32,
}

/// 单条轨道的描述信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackInfo {
    /// 容器内的流索引
    pub stream_index: usize,
    pub track_type: TrackType,
    pub codec_name: String,
    pub language: Option<String>,
    pub title: Option<String>,
    /// 容器标记的默认轨道
    pub is_default: bool,
}

/// 媒体信息（打开成功后填充）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub url: String,
    pub duration_us: i64,
    pub video_tracks: Vec<TrackInfo>,
    pub audio_tracks: Vec<TrackInfo>,
    pub subtitle_tracks: Vec<TrackInfo>,
    pub metadata: HashMap<String, String>,
    pub is_seekable: bool,
}

impl MediaInfo {
    pub fn tracks(&self, track_type: TrackType) -> &[TrackInfo] {
        match track_type {
            TrackType::Video => &self.video_tracks,
            TrackType::Audio => &self.audio_tracks,
            TrackType::Subtitle => &self.subtitle_tracks,
        }
    }
}

/// 播放会话状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

/// 引擎向外部上报的事件（轮询获取）
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// 所有活跃渲染器都播到了末尾
    EndOfStream,
    /// 播放位置更新（微秒）
    PositionChanged(i64),
    /// 某条轨道开启失败，已禁用该轨道（非致命）
    TrackDisabled(TrackType, String),
    /// 致命错误，会话已停止
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_lists_by_type() {
        let mut info = MediaInfo::default();
        info.audio_tracks.push(TrackInfo {
            stream_index: 1,
            track_type: TrackType::Audio,
            codec_name: "aac".into(),
            language: Some("zho".into()),
            title: None,
            is_default: true,
        });
        assert_eq!(info.tracks(TrackType::Audio).len(), 1);
        assert!(info.tracks(TrackType::Video).is_empty());
    }
}
