use crate::core::{PlayerError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig, SupportedStreamConfigRange};
use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 音频接收端协商出的输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSinkFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// 音频输出端。写入为部分接受语义：返回实际吃下的采样数，
/// 剩余部分由调用方保留重试，保证不丢采样。
pub trait AudioSink: Send {
    fn format(&self) -> AudioSinkFormat;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);

    /// 写入交错 f32 采样，返回接受的采样数（0 表示缓冲已满）
    fn write(&mut self, samples: &[f32]) -> usize;

    /// 还能接受多少采样
    fn free_samples(&self) -> usize;

    /// 已实际播放的时长（微秒），单调不减
    fn processed_us(&self) -> i64;

    /// 已写入但尚未播放的缓冲时长（微秒）
    fn latency_us(&self) -> i64;

    fn set_volume(&mut self, volume: f32);

    /// 丢弃尚未播放的缓冲（跳转时调用）
    fn clear(&mut self);
}

/// 基于 cpal 的音频输出 - SegQueue 做无锁环形缓冲
pub struct CpalAudioOutput {
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
    buffer: Arc<SegQueue<f32>>,
    /// 设备回调累计消费的采样数
    processed_samples: Arc<AtomicU64>,
    volume: Arc<Mutex<f32>>,
    capacity: usize,
}

// cpal::Stream 本身不是 Send，但 stream 只在 start() 之后的音频渲染
// 线程里创建和销毁，结构体跨线程移动时 stream 恒为 None
unsafe impl Send for CpalAudioOutput {}

impl CpalAudioOutput {
    /// 创建音频输出（支持非标准配置自动回退）
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        info!("初始化音频输出: {} Hz, {} 声道", sample_rate, channels);

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::AudioError("无法找到音频输出设备".to_string()))?;

        debug!("使用音频设备: {}", device.name().unwrap_or_default());

        let mut config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // 检查设备是否支持该配置，不支持则回退到标准配置
        if !Self::device_supports(&device, &config)? {
            warn!(
                "⚠️  音频设备不支持 {} Hz, {} 声道配置，回退到标准配置",
                sample_rate, channels
            );

            let fallback_configs = [
                (48000, 2), // 最常见
                (44100, 2), // CD 音质
                (48000, 1),
                (44100, 1),
                (sample_rate, 1),
            ];

            let mut found = false;
            for (fb_rate, fb_channels) in fallback_configs {
                let fb_config = StreamConfig {
                    channels: fb_channels,
                    sample_rate: cpal::SampleRate(fb_rate),
                    buffer_size: cpal::BufferSize::Default,
                };
                if Self::device_supports(&device, &fb_config)? {
                    info!("✅ 使用回退配置: {} Hz, {} 声道", fb_rate, fb_channels);
                    config = fb_config;
                    found = true;
                    break;
                }
            }

            if !found {
                return Err(PlayerError::AudioError(format!(
                    "音频设备不支持任何标准配置 (原请求: {} Hz, {} 声道)",
                    sample_rate, channels
                )));
            }
        }

        // 约半秒的环形缓冲
        let capacity = (config.sample_rate.0 as usize * config.channels as usize) / 2;

        Ok(Self {
            device,
            config,
            stream: None,
            buffer: Arc::new(SegQueue::new()),
            processed_samples: Arc::new(AtomicU64::new(0)),
            volume: Arc::new(Mutex::new(1.0)),
            capacity,
        })
    }

    fn device_supports(device: &Device, config: &StreamConfig) -> Result<bool> {
        let supported = device
            .supported_output_configs()
            .map_err(|e| PlayerError::AudioError(format!("无法获取支持的音频配置: {}", e)))?;
        Ok(supported.into_iter().any(|s| Self::is_config_compatible(config, &s)))
    }

    fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
        let rate_in_range = config.sample_rate.0 >= supported.min_sample_rate().0
            && config.sample_rate.0 <= supported.max_sample_rate().0;
        let channels_match = config.channels == supported.channels();
        rate_in_range && channels_match
    }

    fn samples_to_us(&self, samples: u64) -> i64 {
        let frames = samples / self.config.channels as u64;
        (frames * 1_000_000 / self.config.sample_rate.0 as u64) as i64
    }
}

impl AudioSink for CpalAudioOutput {
    fn format(&self) -> AudioSinkFormat {
        AudioSinkFormat {
            sample_rate: self.config.sample_rate.0,
            channels: self.config.channels,
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let buffer = self.buffer.clone();
        let volume = self.volume.clone();
        let processed = self.processed_samples.clone();

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let vol = *volume.lock();
                    let mut popped: u64 = 0;
                    for sample in data.iter_mut() {
                        if let Some(value) = buffer.pop() {
                            *sample = value * vol;
                            popped += 1;
                        } else {
                            // 欠载时补静音，processed 不前进
                            *sample = 0.0;
                        }
                    }
                    processed.fetch_add(popped, Ordering::Relaxed);
                },
                move |err| {
                    log::error!("音频流错误: {}", err);
                },
                None,
            )
            .map_err(|e| PlayerError::AudioError(format!("创建音频流失败: {}", e)))?;

        stream
            .play()
            .map_err(|e| PlayerError::AudioError(format!("启动音频流失败: {}", e)))?;

        self.stream = Some(stream);
        info!("🔊 音频输出已启动");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            info!("音频输出已停止");
        }
    }

    fn write(&mut self, samples: &[f32]) -> usize {
        let free = self.free_samples();
        let n = samples.len().min(free);
        for &sample in &samples[..n] {
            self.buffer.push(sample);
        }
        n
    }

    fn free_samples(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }

    fn processed_us(&self) -> i64 {
        self.samples_to_us(self.processed_samples.load(Ordering::Relaxed))
    }

    fn latency_us(&self) -> i64 {
        self.samples_to_us(self.buffer.len() as u64)
    }

    fn set_volume(&mut self, volume: f32) {
        *self.volume.lock() = volume.clamp(0.0, 1.0);
    }

    fn clear(&mut self) {
        while self.buffer.pop().is_some() {}
    }
}

impl Drop for CpalAudioOutput {
    fn drop(&mut self) {
        self.stop();
    }
}
