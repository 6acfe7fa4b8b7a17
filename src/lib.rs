//! 多线程媒体播放引擎。
//!
//! 解复用、各流解码、音视频渲染分别运行在独立 worker 线程上，
//! 由共享播放时钟统一节拍。对外入口是 [`PlaybackManager`]：
//! 打开媒体、挂接音视频接收端、控制播放/跳转/倍速/切轨，
//! 并通过 [`PlayerEvent`] 上报播放进度与结束。

pub mod core;
pub mod player;

pub use crate::core::{
    ClockController, ClockType, ColorRange, ColorSpace, ColorTransfer, MediaInfo, PlaybackState,
    PlayerError, PlayerEvent, Result, TrackInfo, TrackType, VideoFrame,
};
pub use crate::player::{
    AudioSink, AudioSinkFormat, CpalAudioOutput, NullVideoSink, PlaybackManager, VideoSink,
};
