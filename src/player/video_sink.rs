use crate::core::VideoFrame;

/// 视频展示端。渲染器在展示时刻调用，实现方（UI/测试桩）负责上屏。
pub trait VideoSink: Send + Sync {
    fn set_video_frame(&self, frame: VideoFrame);

    /// 清除当前画面（停止/跳转时调用）
    fn clear_video_frame(&self);

    /// 设置叠加字幕文本；空字符串表示清除
    fn set_subtitle_text(&self, text: &str);
}

/// 丢弃一切输出的占位接收端（未设置视频输出时使用）
pub struct NullVideoSink;

impl VideoSink for NullVideoSink {
    fn set_video_frame(&self, _frame: VideoFrame) {}
    fn clear_video_frame(&self) {}
    fn set_subtitle_text(&self, _text: &str) {}
}
