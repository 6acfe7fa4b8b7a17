use anyhow::{anyhow, Result};
use log::info;
use playback_engine::{
    CpalAudioOutput, PlaybackManager, PlayerEvent, VideoFrame, VideoSink,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 命令行演示用的视频接收端：只统计帧数，不真正绘制
struct StatsVideoSink {
    frames: AtomicU64,
}

impl VideoSink for StatsVideoSink {
    fn set_video_frame(&self, frame: VideoFrame) {
        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 250 == 0 {
            info!(
                "🖼️ 已渲染 {} 帧（当前 {}x{} @ {} ms）",
                n,
                frame.width,
                frame.height,
                frame.pts_us / 1000
            );
        }
    }

    fn clear_video_frame(&self) {}

    fn set_subtitle_text(&self, text: &str) {
        if !text.is_empty() {
            info!("💬 {}", text.replace('\n', " / "));
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let url = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("用法: play <文件或 URL>"))?;

    ffmpeg_next::init().map_err(|e| anyhow!("FFmpeg 初始化失败: {}", e))?;

    let mut manager = PlaybackManager::new();
    manager.set_video_sink(Arc::new(StatsVideoSink {
        frames: AtomicU64::new(0),
    }));
    match CpalAudioOutput::new(48000, 2) {
        Ok(output) => manager.set_audio_sink(Box::new(output)),
        Err(e) => log::warn!("⚠️  音频输出不可用，仅播放视频: {}", e),
    }

    let media_info = manager.open(&url)?;
    info!(
        "🎬 {} | 时长 {} ms | 视频 {} 路 / 音频 {} 路 / 字幕 {} 路",
        media_info.url,
        media_info.duration_us / 1000,
        media_info.video_tracks.len(),
        media_info.audio_tracks.len(),
        media_info.subtitle_tracks.len(),
    );

    manager.play()?;

    loop {
        match manager.poll_event() {
            Some(PlayerEvent::EndOfStream) => {
                info!("🏁 播放结束");
                break;
            }
            Some(PlayerEvent::Error(msg)) => {
                return Err(anyhow!("播放出错: {}", msg));
            }
            Some(PlayerEvent::TrackDisabled(track_type, reason)) => {
                log::warn!("⚠️  {}轨道已停用: {}", track_type.as_str(), reason);
            }
            Some(PlayerEvent::PositionChanged(_)) => {}
            None => std::thread::sleep(Duration::from_millis(20)),
        }
    }

    Ok(())
}
