use crate::core::{
    ClockController, ClockType, MediaInfo, PlaybackState, PlayerError, PlayerEvent, Result,
    TrackType,
};
use crate::player::audio_output::AudioSink;
use crate::player::audio_renderer::AudioRenderer;
use crate::player::demuxer::Demuxer;
use crate::player::input::{self, MediaOpener, OpenedMedia};
use crate::player::renderer::Renderer;
use crate::player::video_renderer::VideoRenderer;
use crate::player::video_sink::VideoSink;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{info, warn};
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn log_ctx() -> String {
    format!("[pid:{}-tid:{:?}]", process::id(), thread::current().id())
}

/// 位置事件的最小间隔
const POSITION_EVENT_INTERVAL: Duration = Duration::from_millis(100);

struct ActiveMedia {
    info: MediaInfo,
    demuxer: Demuxer,
    /// 各类型当前启用的流索引
    active: [Option<usize>; 3],
}

impl ActiveMedia {
    fn active_slot(&mut self, track_type: TrackType) -> &mut Option<usize> {
        match track_type {
            TrackType::Video => &mut self.active[0],
            TrackType::Audio => &mut self.active[1],
            TrackType::Subtitle => &mut self.active[2],
        }
    }

    fn active_index(&self, track_type: TrackType) -> Option<usize> {
        match track_type {
            TrackType::Video => self.active[0],
            TrackType::Audio => self.active[1],
            TrackType::Subtitle => self.active[2],
        }
    }
}

/// 播放管理器 - 整体控制播放流程。
/// 所有控制方法都在调用方线程执行，实际工作分布在
/// 解复用、解码、渲染各 worker 线程上。
pub struct PlaybackManager {
    clock: ClockController,
    state: PlaybackState,
    media: Option<ActiveMedia>,
    pending_open: Option<MediaOpener>,
    video_renderer: Option<VideoRenderer>,
    audio_renderer: Option<AudioRenderer>,
    video_sink: Option<Arc<dyn VideoSink>>,
    /// 音频渲染器尚未创建时先记住音量
    volume: f32,
    events_tx: Sender<PlayerEvent>,
    events_rx: Receiver<PlayerEvent>,
    eos_emitted: bool,
    last_position_event: Instant,
}

impl PlaybackManager {
    pub fn new() -> Self {
        info!("{} 🎮 创建播放管理器...", log_ctx());
        let (events_tx, events_rx) = unbounded();
        Self {
            clock: ClockController::new(),
            state: PlaybackState::Stopped,
            media: None,
            pending_open: None,
            video_renderer: None,
            audio_renderer: None,
            video_sink: None,
            volume: 1.0,
            events_tx,
            events_rx,
            eos_emitted: false,
            last_position_event: Instant::now(),
        }
    }

    /// 挂接视频接收端并创建视频渲染线程
    pub fn set_video_sink(&mut self, sink: Arc<dyn VideoSink>) {
        let renderer = VideoRenderer::new(sink.clone(), self.clock.register(ClockType::Video));
        renderer.set_paused(self.state != PlaybackState::Playing);
        if let Some(media) = &self.media {
            if let Some(index) = media.active_index(TrackType::Video) {
                renderer.set_stream(media.demuxer.stream_shared(index));
            }
            if let Some(index) = media.active_index(TrackType::Subtitle) {
                renderer.set_subtitle_stream(media.demuxer.stream_shared(index));
            }
        }
        self.video_sink = Some(sink);
        self.video_renderer = Some(renderer);
    }

    /// 挂接音频输出端并创建音频渲染线程
    pub fn set_audio_sink(&mut self, sink: Box<dyn AudioSink>) {
        let renderer = AudioRenderer::new(sink, self.clock.register(ClockType::Audio));
        renderer.set_paused(self.state != PlaybackState::Playing);
        renderer.set_volume(self.volume);
        if let Some(media) = &self.media {
            if let Some(index) = media.active_index(TrackType::Audio) {
                renderer.set_stream(media.demuxer.stream_shared(index));
            }
        }
        self.audio_renderer = Some(renderer);
    }

    /// 同步打开媒体（网络源可能阻塞较久，优先考虑 open_async）
    pub fn open(&mut self, url: &str) -> Result<MediaInfo> {
        info!("{} 📂 打开媒体: {}", log_ctx(), url);
        let input = input::open_input(url)?;
        let info = input::probe_media(&input, url);
        self.set_media(OpenedMedia { input, info })
    }

    /// 后台线程打开媒体，结果通过 poll() 取回
    pub fn open_async(&mut self, url: &str) {
        info!("{} 📂 后台打开媒体: {}", log_ctx(), url);
        self.pending_open = Some(MediaOpener::spawn(url.to_string()));
    }

    /// 装载已打开的媒体：建立解复用器、启用默认轨道、停在起点
    pub fn set_media(&mut self, opened: OpenedMedia) -> Result<MediaInfo> {
        self.close();

        let info = opened.info;
        let demuxer = Demuxer::new(opened.input, self.events_tx.clone());
        let mut media = ActiveMedia {
            info: info.clone(),
            demuxer,
            active: [None, None, None],
        };

        for track_type in TrackType::ALL {
            let Some(index) = input::default_stream(&info, track_type) else {
                continue;
            };
            match media.demuxer.add_stream(index) {
                Ok(shared) => {
                    *media.active_slot(track_type) = Some(index);
                    self.attach_to_renderer(track_type, Some(shared));
                }
                Err(e) => {
                    warn!("⚠️  默认{}轨道启用失败: {}", track_type.as_str(), e);
                    let _ = self
                        .events_tx
                        .send(PlayerEvent::TrackDisabled(track_type, e.to_string()));
                }
            }
        }

        self.clock.sync_to(0);
        self.clock.set_paused(true);
        media.demuxer.start_decoding();
        self.media = Some(media);
        self.state = PlaybackState::Paused;
        self.eos_emitted = false;

        // 暂停态下单步一次，把首帧画出来
        if let Some(r) = &self.video_renderer {
            r.single_step();
        }

        info!("{} ✅ 媒体已装载: {}", log_ctx(), info.url);
        Ok(info)
    }

    pub fn play(&mut self) -> Result<()> {
        let Some(media) = &self.media else {
            return Err(PlayerError::InvalidState("尚未打开媒体".to_string()));
        };
        if self.state == PlaybackState::Playing {
            return Ok(());
        }
        info!("{} ▶️ 开始播放", log_ctx());
        media.demuxer.start_decoding();
        self.clock.set_paused(false);
        self.for_each_renderer(|r| r.set_paused(false));
        self.state = PlaybackState::Playing;
        self.eos_emitted = false;
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.state != PlaybackState::Playing {
            return;
        }
        info!("{} ⏸️ 暂停播放", log_ctx());
        self.clock.set_paused(true);
        self.for_each_renderer(|r| r.set_paused(true));
        self.state = PlaybackState::Paused;
    }

    pub fn toggle_pause(&mut self) -> Result<()> {
        match self.state {
            PlaybackState::Playing => {
                self.pause();
                Ok(())
            }
            _ => self.play(),
        }
    }

    /// 停止播放并回到起点，媒体保持装载
    pub fn stop(&mut self) {
        if self.media.is_none() {
            return;
        }
        info!("{} 🛑 停止播放", log_ctx());
        self.clock.set_paused(true);
        self.for_each_renderer(|r| r.set_paused(true));
        if let Some(media) = &self.media {
            media.demuxer.stop_decoding();
            if media.info.is_seekable {
                if let Err(e) = media.demuxer.seek(0) {
                    warn!("回到起点失败: {}", e);
                }
            }
        }
        self.clock.sync_to(0);
        if let Some(r) = &self.audio_renderer {
            r.mark_output_dirty();
        }
        if let Some(sink) = &self.video_sink {
            sink.clear_video_frame();
            sink.set_subtitle_text("");
        }
        self.state = PlaybackState::Stopped;
        self.eos_emitted = false;
    }

    /// 跳转到指定位置（微秒），返回实际落点
    pub fn seek(&mut self, pos_us: i64) -> Result<i64> {
        let Some(media) = &self.media else {
            return Err(PlayerError::InvalidState("尚未打开媒体".to_string()));
        };
        if !media.info.is_seekable {
            return Err(PlayerError::InvalidState("当前媒体不支持跳转".to_string()));
        }
        let target = pos_us.clamp(0, media.info.duration_us.max(0));
        info!("{} ⏩ 跳转到 {} ms", log_ctx(), target / 1000);

        // 时钟先对齐目标：预读包一路出来的新帧不能按旧时间线被丢弃
        self.clock.sync_to(target);
        let effective = media.demuxer.seek(target)?;
        self.clock.sync_to(effective);
        media.demuxer.start_decoding();

        if let Some(r) = &self.audio_renderer {
            r.mark_output_dirty();
        }
        self.for_each_renderer(|r| r.reset_at_end());
        self.eos_emitted = false;

        if self.state != PlaybackState::Playing {
            // 暂停态下也要把落点画面刷出来
            if let Some(r) = &self.video_renderer {
                r.single_step();
            }
        }
        Ok(effective)
    }

    /// 设置倍速（时间线连续，不产生跳变）
    pub fn set_playback_rate(&mut self, rate: f64) {
        let rate = rate.clamp(0.1, 8.0);
        info!("{} 🎚️ 倍速 {:.2}x", log_ctx(), rate);
        self.clock.set_playback_rate(rate);
        if let Some(r) = &self.audio_renderer {
            // 重采样链路按新倍速重建
            r.mark_output_dirty();
        }
    }

    pub fn playback_rate(&self) -> f64 {
        self.clock.playback_rate()
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        if let Some(r) = &self.audio_renderer {
            r.set_volume(self.volume);
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// 切换轨道；None 表示停用该类型
    pub fn set_active_track(&mut self, track_type: TrackType, index: Option<usize>) -> Result<()> {
        let Some(media) = &mut self.media else {
            return Err(PlayerError::InvalidState("尚未打开媒体".to_string()));
        };
        if let Some(index) = index {
            if !media
                .info
                .tracks(track_type)
                .iter()
                .any(|t| t.stream_index == index)
            {
                return Err(PlayerError::InvalidState(format!(
                    "流 #{index} 不是{}轨道",
                    track_type.as_str()
                )));
            }
        }
        if media.active_index(track_type) == index {
            return Ok(());
        }
        info!(
            "{} 🔀 切换{}轨道 → {:?}",
            log_ctx(),
            track_type.as_str(),
            index
        );

        if let Some(old) = media.active_index(track_type) {
            media.demuxer.remove_stream(old);
        }
        *media.active_slot(track_type) = None;
        self.attach_to_renderer(track_type, None);

        let Some(index) = index else {
            return Ok(());
        };

        let media = self.media.as_mut().expect("媒体仍在");
        let shared = media.demuxer.add_stream(index)?;
        *media.active_slot(track_type) = Some(index);
        self.attach_to_renderer(track_type, Some(shared));

        // 回到当前位置，让新轨道与画面对齐
        let pos = self.position_us();
        let media = self.media.as_ref().expect("媒体仍在");
        if media.info.is_seekable {
            if let Err(e) = self.seek(pos) {
                warn!("切轨后重新对齐失败: {}", e);
            }
        } else {
            media.demuxer.start_decoding();
        }
        Ok(())
    }

    pub fn active_track(&self, track_type: TrackType) -> Option<usize> {
        self.media.as_ref()?.active_index(track_type)
    }

    /// 当前有可用（已成功打开）的视频轨道
    pub fn is_video_available(&self) -> bool {
        self.active_track(TrackType::Video).is_some()
    }

    pub fn is_audio_available(&self) -> bool {
        self.active_track(TrackType::Audio).is_some()
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn media_info(&self) -> Option<&MediaInfo> {
        self.media.as_ref().map(|m| &m.info)
    }

    pub fn duration_us(&self) -> i64 {
        self.media.as_ref().map_or(0, |m| m.info.duration_us)
    }

    /// 当前播放位置（微秒）
    pub fn position_us(&self) -> i64 {
        let pos = self.clock.current_time_us();
        let duration = self.duration_us();
        if duration > 0 {
            pos.clamp(0, duration)
        } else {
            pos.max(0)
        }
    }

    /// 取下一个事件；同时驱动后台打开与播完检测，应周期性调用
    pub fn poll_event(&mut self) -> Option<PlayerEvent> {
        self.finish_pending_open();

        if let Ok(event) = self.events_rx.try_recv() {
            return Some(event);
        }

        if self.state == PlaybackState::Playing && self.all_renderers_at_end() && !self.eos_emitted
        {
            info!("{} 🏁 播放完毕", log_ctx());
            self.clock.set_paused(true);
            self.for_each_renderer(|r| r.set_paused(true));
            self.state = PlaybackState::Paused;
            self.eos_emitted = true;
            return Some(PlayerEvent::EndOfStream);
        }

        if self.state == PlaybackState::Playing
            && self.last_position_event.elapsed() >= POSITION_EVENT_INTERVAL
        {
            self.last_position_event = Instant::now();
            return Some(PlayerEvent::PositionChanged(self.position_us()));
        }

        None
    }

    /// 卸载当前媒体并释放播放线程
    pub fn close(&mut self) {
        if self.media.is_none() {
            return;
        }
        info!("{} 🧹 卸载媒体", log_ctx());
        self.for_each_renderer(|r| r.set_stream(None));
        if let Some(r) = &self.video_renderer {
            r.set_subtitle_stream(None);
        }
        if let Some(r) = &self.audio_renderer {
            r.mark_output_dirty();
        }
        if let Some(mut media) = self.media.take() {
            media.demuxer.kill();
        }
        if let Some(sink) = &self.video_sink {
            sink.clear_video_frame();
            sink.set_subtitle_text("");
        }
        self.clock.sync_to(0);
        self.clock.set_paused(true);
        self.state = PlaybackState::Stopped;
        self.eos_emitted = false;
    }

    fn finish_pending_open(&mut self) {
        let Some(opener) = &self.pending_open else {
            return;
        };
        let Some(result) = opener.try_result() else {
            return;
        };
        self.pending_open = None;
        match result {
            Ok(opened) => {
                if let Err(e) = self.set_media(opened) {
                    let _ = self.events_tx.send(PlayerEvent::Error(e.to_string()));
                }
            }
            Err(e) => {
                warn!("❌ 后台打开失败: {}", e);
                let _ = self.events_tx.send(PlayerEvent::Error(e.to_string()));
            }
        }
    }

    fn attach_to_renderer(
        &self,
        track_type: TrackType,
        shared: Option<Arc<crate::player::stream_decoder::StreamDecoderShared>>,
    ) {
        match track_type {
            TrackType::Video => {
                if let Some(r) = &self.video_renderer {
                    r.set_stream(shared);
                }
            }
            TrackType::Audio => {
                if let Some(r) = &self.audio_renderer {
                    r.set_stream(shared);
                    r.mark_output_dirty();
                }
            }
            TrackType::Subtitle => {
                if let Some(r) = &self.video_renderer {
                    r.set_subtitle_stream(shared);
                }
                if let Some(sink) = &self.video_sink {
                    sink.set_subtitle_text("");
                }
            }
        }
    }

    /// 所有接着流的音视频渲染器都报告播完。字幕流不参与判定：
    /// 末尾的字幕区间可以比最后一帧画面晚，不该拖住播完事件。
    fn all_renderers_at_end(&self) -> bool {
        let Some(media) = &self.media else {
            return false;
        };
        let mut flags = Vec::new();
        if media.active_index(TrackType::Video).is_some() {
            if let Some(r) = &self.video_renderer {
                flags.push(r.is_at_end());
            }
        }
        if media.active_index(TrackType::Audio).is_some() {
            if let Some(r) = &self.audio_renderer {
                flags.push(r.is_at_end());
            }
        }
        renderers_at_end(flags.into_iter())
    }

    fn for_each_renderer(&self, mut f: impl FnMut(&dyn Renderer)) {
        if let Some(r) = &self.video_renderer {
            f(r);
        }
        if let Some(r) = &self.audio_renderer {
            f(r);
        }
    }
}

/// 播完聚合：每个参与判定的渲染器都播完，且至少有一个参与
fn renderers_at_end(flags: impl Iterator<Item = bool>) -> bool {
    let mut any = false;
    for at_end in flags {
        if !at_end {
            return false;
        }
        any = true;
    }
    any
}

impl Default for PlaybackManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PlaybackManager {
    fn drop(&mut self) {
        info!("{} 🧹 销毁播放管理器", log_ctx());
        self.close();
        if let Some(mut r) = self.video_renderer.take() {
            r.kill();
        }
        if let Some(mut r) = self.audio_renderer.take() {
            r.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_of_stream_needs_every_renderer_done() {
        assert!(!renderers_at_end([true, false].into_iter()));
        assert!(!renderers_at_end([false, true].into_iter()));
        assert!(renderers_at_end([true, true].into_iter()));
        // 单轨媒体：唯一的渲染器播完即整体播完
        assert!(renderers_at_end([true].into_iter()));
    }

    #[test]
    fn no_attached_renderer_never_ends() {
        assert!(!renderers_at_end(std::iter::empty()));
    }
}
