use crate::core::Result;
use crate::player::audio_output::AudioSinkFormat;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{software, util};
use log::debug;

/// 采样补偿的推进决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationStep {
    /// 剩余补偿距离足够，继续
    Continue,
    /// 剩余距离不足一帧，撤销补偿（不足量不值得拉伸，直接归零重来）
    Reset,
}

/// 纯决策函数：剩余补偿距离对上即将处理的一帧采样数
pub fn compensation_step(remaining_samples: i64, frame_samples: i64) -> CompensationStep {
    if remaining_samples < frame_samples {
        CompensationStep::Reset
    } else {
        CompensationStep::Continue
    }
}

fn layout_for_channels(channels: u16) -> util::channel_layout::ChannelLayout {
    match channels {
        1 => util::channel_layout::ChannelLayout::MONO,
        2 => util::channel_layout::ChannelLayout::STEREO,
        6 => util::channel_layout::ChannelLayout::_5POINT1,
        _ => util::channel_layout::ChannelLayout::STEREO,
    }
}

/// 音频重采样器：解码帧 → 输出端格式的交错 f32。
///
/// 倍速播放通过缩放输出采样率实现：2 倍速时按 rate/2 重采样，
/// 设备仍按原速率消费，媒体时间便以 2 倍流逝。
pub struct AudioResampler {
    context: software::resampling::Context,
    target: AudioSinkFormat,
    playback_rate: f64,
    /// swr 补偿还要作用的采样数
    compensation_remaining: i64,
}

// SwrContext 只在音频渲染线程中使用
unsafe impl Send for AudioResampler {}

impl AudioResampler {
    pub fn new(
        frame: &util::frame::Audio,
        target: AudioSinkFormat,
        playback_rate: f64,
    ) -> Result<Self> {
        let rate = if playback_rate > 0.0 { playback_rate } else { 1.0 };
        let out_rate = (target.sample_rate as f64 / rate).round() as u32;

        debug!(
            "🔧 初始化音频重采样器: {}Hz/{}ch {:?} → {}Hz/{}ch f32 (倍速 {rate})",
            frame.rate(),
            frame.channels(),
            frame.format(),
            out_rate,
            target.channels,
        );

        let context = software::resampling::Context::get(
            frame.format(),
            frame.channel_layout(),
            frame.rate(),
            util::format::Sample::F32(util::format::sample::Type::Packed),
            layout_for_channels(target.channels),
            out_rate,
        )?;

        Ok(Self {
            context,
            target,
            playback_rate: rate,
            compensation_remaining: 0,
        })
    }

    pub fn playback_rate(&self) -> f64 {
        self.playback_rate
    }

    pub fn target(&self) -> AudioSinkFormat {
        self.target
    }

    /// 重采样一帧，输出交错 f32 采样
    pub fn run(&mut self, frame: &util::frame::Audio) -> Result<Vec<f32>> {
        self.advance_compensation(frame.samples() as i64);

        let mut resampled = util::frame::Audio::empty();
        self.context.run(frame, &mut resampled)?;

        let samples = resampled.samples() * self.target.channels as usize;
        if samples == 0 {
            return Ok(Vec::new());
        }
        // packed f32 数据在 plane 0 连续存放
        let data = unsafe {
            std::slice::from_raw_parts(resampled.data(0).as_ptr() as *const f32, samples)
        };
        Ok(data.to_vec())
    }

    /// 在接下来 distance 个输入采样内匀开 delta 个采样的伸缩，
    /// 用于吸收音频钟与主时间线的缓慢漂移
    pub fn set_sample_compensation(&mut self, delta: i32, distance: u32) {
        let ret = unsafe {
            ffmpeg::ffi::swr_set_compensation(
                self.context.as_mut_ptr(),
                delta,
                distance as i32,
            )
        };
        if ret < 0 {
            debug!("采样补偿不受支持 ({ret})");
            self.compensation_remaining = 0;
        } else {
            self.compensation_remaining = distance as i64;
        }
    }

    pub fn active_compensation(&self) -> i64 {
        self.compensation_remaining
    }

    fn advance_compensation(&mut self, frame_samples: i64) {
        if self.compensation_remaining == 0 {
            return;
        }
        match compensation_step(self.compensation_remaining, frame_samples) {
            CompensationStep::Continue => self.compensation_remaining -= frame_samples,
            CompensationStep::Reset => {
                unsafe {
                    let _ = ffmpeg::ffi::swr_set_compensation(self.context.as_mut_ptr(), 0, 0);
                }
                self.compensation_remaining = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compensation_continues_while_distance_remains() {
        assert_eq!(compensation_step(4096, 1024), CompensationStep::Continue);
        assert_eq!(compensation_step(1024, 1024), CompensationStep::Continue);
    }

    #[test]
    fn short_remainder_resets() {
        assert_eq!(compensation_step(1023, 1024), CompensationStep::Reset);
        assert_eq!(compensation_step(0, 1024), CompensationStep::Reset);
    }

    #[test]
    fn layout_fallback_is_stereo() {
        assert_eq!(layout_for_channels(2), layout_for_channels(7));
        assert_ne!(layout_for_channels(1), layout_for_channels(2));
    }
}
