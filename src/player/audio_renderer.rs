use crate::player::audio_output::AudioSink;
use crate::player::frame::FramePayload;
use crate::player::renderer::Renderer;
use crate::player::resampler::AudioResampler;
use crate::player::stream_decoder::StreamDecoderShared;
use crate::player::worker::{Worker, WorkerControl, WorkerHandle};
use crate::core::Clock;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 音频钟漂移超过该值才启动采样补偿
const DRIFT_THRESHOLD_US: i64 = 50_000;
/// 补偿匀开的输入采样跨度（约一秒）
const COMPENSATION_DISTANCE: u32 = 48_000;
/// 输出端满载时的最小重试间隔，防止空转
const SINK_FULL_FLOOR: Duration = Duration::from_millis(5);

struct AudioRendererShared {
    stream: Mutex<Option<Arc<StreamDecoderShared>>>,
    at_end: AtomicBool,
    /// 跳转/变速后置位：丢弃输出缓冲并重建重采样器
    output_dirty: AtomicBool,
    volume: Mutex<f32>,
    volume_dirty: AtomicBool,
    control: Arc<WorkerControl>,
}

/// 音频渲染器：取解码帧重采样喂给输出端，并驱动音频时钟。
/// 时钟以设备实际消费的采样数推进，不受缓冲深度影响。
pub struct AudioRenderer {
    shared: Arc<AudioRendererShared>,
    worker: WorkerHandle,
}

impl AudioRenderer {
    pub fn new(sink: Box<dyn AudioSink>, clock: Clock) -> Self {
        let control = WorkerControl::new();
        let shared = Arc::new(AudioRendererShared {
            stream: Mutex::new(None),
            at_end: AtomicBool::new(false),
            output_dirty: AtomicBool::new(false),
            volume: Mutex::new(1.0),
            volume_dirty: AtomicBool::new(false),
            control: control.clone(),
        });
        let worker = WorkerHandle::spawn_with(
            control,
            AudioRendererWorker {
                shared: shared.clone(),
                sink,
                clock,
                resampler: None,
                pending: Vec::new(),
                pending_offset: 0,
                started: false,
                audio_base_us: 0,
                processed_base_us: 0,
            },
        );
        Self { shared, worker }
    }

    /// 丢弃已缓冲的输出并在下一帧重建重采样链路
    pub fn mark_output_dirty(&self) {
        self.shared.output_dirty.store(true, Ordering::SeqCst);
        self.shared.control.wake();
    }

    pub fn set_volume(&self, volume: f32) {
        *self.shared.volume.lock() = volume.clamp(0.0, 1.0);
        self.shared.volume_dirty.store(true, Ordering::SeqCst);
        self.shared.control.wake();
    }

    pub fn volume(&self) -> f32 {
        *self.shared.volume.lock()
    }

    pub fn kill(&mut self) {
        self.worker.kill();
    }
}

impl Renderer for AudioRenderer {
    fn set_stream(&self, stream: Option<Arc<StreamDecoderShared>>) {
        let mut guard = self.shared.stream.lock();
        if let Some(old) = guard.take() {
            old.detach_renderer();
        }
        if let Some(s) = &stream {
            s.attach_renderer(self.shared.control.clone());
        }
        *guard = stream;
        drop(guard);
        self.shared.at_end.store(false, Ordering::SeqCst);
        self.shared.output_dirty.store(true, Ordering::SeqCst);
        self.shared.control.wake();
    }

    fn set_paused(&self, paused: bool) {
        if paused {
            self.shared.control.request_pause();
            // 暂停立即静音，不让残余缓冲播完
            self.shared.output_dirty.store(true, Ordering::SeqCst);
        } else {
            self.shared.control.request_unpause();
        }
    }

    fn single_step(&self) {
        self.shared.control.request_single_step();
    }

    fn is_at_end(&self) -> bool {
        self.shared.at_end.load(Ordering::SeqCst)
    }

    fn reset_at_end(&self) {
        self.shared.at_end.store(false, Ordering::SeqCst);
        self.shared.control.wake();
    }
}

struct AudioRendererWorker {
    shared: Arc<AudioRendererShared>,
    sink: Box<dyn AudioSink>,
    clock: Clock,
    resampler: Option<AudioResampler>,
    /// 输出端没吃完的重采样剩余
    pending: Vec<f32>,
    pending_offset: usize,
    started: bool,
    /// 当前段第一帧的媒体时间
    audio_base_us: i64,
    /// 当前段起点时设备已消费的时长
    processed_base_us: i64,
}

impl Worker for AudioRendererWorker {
    fn name(&self) -> &'static str {
        "audio-renderer"
    }

    fn should_wait(&self) -> bool {
        if self.shared.output_dirty.load(Ordering::SeqCst)
            || self.shared.volume_dirty.load(Ordering::SeqCst)
        {
            return false;
        }
        if self.pending_offset < self.pending.len() {
            return false;
        }
        let guard = self.shared.stream.lock();
        let Some(stream) = guard.as_ref() else {
            return true;
        };
        if stream.peek_frame().is_some() {
            return false;
        }
        !(stream.at_end() && !self.shared.at_end.load(Ordering::SeqCst))
    }

    fn loop_once(&mut self, control: &WorkerControl) -> Option<Duration> {
        if self.shared.output_dirty.swap(false, Ordering::SeqCst) {
            self.reset_output();
        }
        if self.shared.volume_dirty.swap(false, Ordering::SeqCst) {
            self.sink.set_volume(*self.shared.volume.lock());
        }

        // 先把上次没写完的残留推出去
        if self.pending_offset < self.pending.len() {
            return self.flush_pending();
        }

        let stream = self.shared.stream.lock().clone()?;
        let Some(frame) = stream.take_frame() else {
            if stream.at_end() && !self.shared.at_end.swap(true, Ordering::SeqCst) {
                debug!("🏁 音频流播放完毕");
            }
            return None;
        };

        if frame.end_us() < self.clock.seek_time_us() {
            return None;
        }
        self.shared.at_end.store(false, Ordering::SeqCst);

        let FramePayload::Audio(avframe) = frame.payload() else {
            return None;
        };

        // 重采样器随第一帧的格式惰性创建；变速后重建
        let rate = self.clock.playback_rate();
        let rebuild = match &self.resampler {
            Some(r) => (r.playback_rate() - rate).abs() > f64::EPSILON,
            None => true,
        };
        if rebuild {
            match AudioResampler::new(avframe, self.sink.format(), rate) {
                Ok(r) => {
                    self.resampler = Some(r);
                    self.audio_base_us = frame.pts_us();
                    self.processed_base_us = self.sink.processed_us();
                }
                Err(e) => {
                    warn!("重采样器初始化失败: {}", e);
                    return None;
                }
            }
        }

        if !self.started {
            if let Err(e) = self.sink.start() {
                warn!("❌ 音频输出启动失败: {}", e);
                return None;
            }
            self.started = true;
        }

        let resampler = self.resampler.as_mut().expect("重采样器已就绪");
        match resampler.run(avframe) {
            Ok(samples) => {
                self.pending = samples;
                self.pending_offset = 0;
            }
            Err(e) => {
                warn!("重采样失败（已跳帧）: {}", e);
                return None;
            }
        }

        self.maybe_compensate_drift();
        control.done_step();
        self.flush_pending()
    }
}

impl AudioRendererWorker {
    fn reset_output(&mut self) {
        self.sink.clear();
        self.resampler = None;
        self.pending.clear();
        self.pending_offset = 0;
        self.audio_base_us = self.clock.current_time_us();
        self.processed_base_us = self.sink.processed_us();
    }

    /// 尽量写入残留采样，写不完时按输出端余量定重试间隔
    fn flush_pending(&mut self) -> Option<Duration> {
        let remaining = &self.pending[self.pending_offset..];
        if remaining.is_empty() {
            return None;
        }
        let written = self.sink.write(remaining);
        self.pending_offset += written;
        if self.pending_offset >= self.pending.len() {
            self.pending.clear();
            self.pending_offset = 0;
        }

        self.publish_clock();

        if written == 0 {
            // 输出端满。用半个输出延迟近似缓冲排空时间，
            // 省去按已写入减已消费换算剩余量
            let half_latency = Duration::from_micros((self.sink.latency_us() / 2).max(0) as u64);
            return Some(half_latency.max(SINK_FULL_FLOOR));
        }
        None
    }

    /// 以设备实际消费量推算媒体时间并上报时钟
    fn publish_clock(&self) {
        if !self.started || self.resampler.is_none() {
            return;
        }
        let elapsed = self.sink.processed_us() - self.processed_base_us;
        if elapsed < 0 {
            return;
        }
        let rate = self.clock.playback_rate();
        let media_us = self.audio_base_us + (elapsed as f64 * rate) as i64;
        self.clock.time_updated(media_us);
    }

    #[cfg(test)]
    fn stash(&mut self, samples: Vec<f32>) {
        self.pending = samples;
        self.pending_offset = 0;
    }

    /// 非主钟时用采样补偿吸收与主时间线的慢漂移
    fn maybe_compensate_drift(&mut self) {
        if self.clock.is_master() || !self.started {
            return;
        }
        let Some(resampler) = self.resampler.as_mut() else {
            return;
        };
        if resampler.active_compensation() > 0 {
            return;
        }
        let elapsed = self.sink.processed_us() - self.processed_base_us;
        let rate = resampler.playback_rate();
        let media_us = self.audio_base_us + (elapsed as f64 * rate) as i64;
        let drift_us = media_us - self.clock.current_time_us();
        if drift_us.abs() < DRIFT_THRESHOLD_US {
            return;
        }
        // 正漂移（音频超前）要多放采样拖慢，delta 为正
        let delta =
            (drift_us as f64 * self.sink.format().sample_rate as f64 / 1_000_000.0) as i32;
        debug!("🎚️ 音频漂移 {} µs，启动采样补偿 delta={}", drift_us, delta);
        resampler.set_sample_compensation(delta, COMPENSATION_DISTANCE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ClockController, ClockType};
    use crate::player::audio_output::AudioSinkFormat;

    /// 每次 write 最多吃 chunk 个采样的桩输出端
    struct ChunkSink {
        chunk: usize,
        written: Arc<Mutex<Vec<f32>>>,
    }

    impl AudioSink for ChunkSink {
        fn format(&self) -> AudioSinkFormat {
            AudioSinkFormat {
                sample_rate: 48000,
                channels: 2,
            }
        }
        fn start(&mut self) -> crate::core::Result<()> {
            Ok(())
        }
        fn stop(&mut self) {}
        fn write(&mut self, samples: &[f32]) -> usize {
            let n = samples.len().min(self.chunk);
            self.written.lock().extend_from_slice(&samples[..n]);
            n
        }
        fn free_samples(&self) -> usize {
            self.chunk
        }
        fn processed_us(&self) -> i64 {
            0
        }
        fn latency_us(&self) -> i64 {
            30_000
        }
        fn set_volume(&mut self, _volume: f32) {}
        fn clear(&mut self) {}
    }

    fn worker(chunk: usize) -> (AudioRendererWorker, Arc<Mutex<Vec<f32>>>) {
        let controller = ClockController::new();
        let control = WorkerControl::new();
        let shared = Arc::new(AudioRendererShared {
            stream: Mutex::new(None),
            at_end: AtomicBool::new(false),
            output_dirty: AtomicBool::new(false),
            volume: Mutex::new(1.0),
            volume_dirty: AtomicBool::new(false),
            control,
        });
        let written = Arc::new(Mutex::new(Vec::new()));
        let worker = AudioRendererWorker {
            shared,
            sink: Box::new(ChunkSink {
                chunk,
                written: written.clone(),
            }),
            clock: controller.register(ClockType::Audio),
            resampler: None,
            pending: Vec::new(),
            pending_offset: 0,
            started: false,
            audio_base_us: 0,
            processed_base_us: 0,
        };
        (worker, written)
    }

    #[test]
    fn partial_writes_lose_no_samples() {
        let (mut w, written) = worker(173);
        let samples: Vec<f32> = (0..1000).map(|i| i as f32).collect();
        w.stash(samples.clone());

        let mut rounds = 0;
        while !w.pending.is_empty() {
            w.flush_pending();
            rounds += 1;
            assert!(rounds < 100, "残留采样未能写完");
        }

        // 全部写入且保持原始顺序
        assert_eq!(*written.lock(), samples);
    }

    #[test]
    fn full_sink_waits_instead_of_spinning() {
        let (mut w, _written) = worker(0);
        w.stash(vec![0.5; 256]);
        let wait = w.flush_pending();
        // 写不进去时按延迟等待，且不低于下限
        assert!(wait.is_some());
        assert!(wait.unwrap() >= SINK_FULL_FLOOR);
        assert_eq!(w.pending_offset, 0);
    }
}
