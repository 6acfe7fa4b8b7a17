use crate::core::{PlayerError, Result, TrackType};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, media, Rational};
use log::{debug, info};
use std::sync::Arc;

/// 一条流的不可变描述。帧和渲染器共享（Arc），解码上下文则由
/// 流解码线程独占，二者职责分离。
pub struct CodecInfo {
    stream_index: usize,
    track_type: TrackType,
    time_base: Rational,
    avg_frame_rate: Option<Rational>,
    codec_name: String,
    /// 顺时针旋转角度（来自容器的 display matrix）
    rotation: i32,
    hw_accelerated: bool,
}

impl CodecInfo {
    pub fn new(
        stream_index: usize,
        track_type: TrackType,
        time_base: Rational,
        avg_frame_rate: Option<Rational>,
        codec_name: String,
        rotation: i32,
    ) -> Self {
        Self {
            stream_index,
            track_type,
            time_base,
            avg_frame_rate,
            codec_name,
            rotation,
            hw_accelerated: false,
        }
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn track_type(&self) -> TrackType {
        self.track_type
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    pub fn rotation(&self) -> i32 {
        self.rotation
    }

    pub fn hw_accelerated(&self) -> bool {
        self.hw_accelerated
    }

    /// 流时间基 → 微秒，四舍五入
    pub fn to_us(&self, ts: i64) -> i64 {
        let num = self.time_base.numerator() as i128;
        let den = self.time_base.denominator() as i128;
        if den == 0 {
            return ts;
        }
        let half = if ts >= 0 { den / 2 } else { -den / 2 };
        ((1_000_000i128 * ts as i128 * num + half) / den) as i64
    }

    /// 按平均帧率推算的单帧时长（微秒）
    pub fn frame_duration_us(&self) -> Option<i64> {
        let rate = self.avg_frame_rate?;
        if rate.numerator() <= 0 || rate.denominator() <= 0 {
            return None;
        }
        Some((1_000_000i64 * rate.denominator() as i64) / rate.numerator() as i64)
    }
}

/// 按媒体类型分派的解码上下文
pub enum CodecContext {
    Video(codec::decoder::Video),
    Audio(codec::decoder::Audio),
    Subtitle(codec::decoder::Subtitle),
}

impl CodecContext {
    pub fn flush(&mut self) {
        match self {
            CodecContext::Video(d) => d.flush(),
            CodecContext::Audio(d) => d.flush(),
            // 字幕解码是无状态的逐包解码，没有要冲刷的内部缓冲
            CodecContext::Subtitle(_) => {}
        }
    }
}

/// 已打开的解码器 + 流描述
pub struct Codec {
    pub context: CodecContext,
    pub info: Arc<CodecInfo>,
}

// 解码上下文只在创建后移入唯一的解码线程使用
unsafe impl Send for Codec {}

pub fn track_type_of(stream: &format::stream::Stream) -> Option<TrackType> {
    match stream.parameters().medium() {
        media::Type::Video => Some(TrackType::Video),
        media::Type::Audio => Some(TrackType::Audio),
        media::Type::Subtitle => Some(TrackType::Subtitle),
        _ => None,
    }
}

impl Codec {
    /// 为一条容器流打开解码器。失败是针对单条轨道的非致命格式错误。
    pub fn open(stream: &format::stream::Stream, rotation: i32) -> Result<Self> {
        let track_type = track_type_of(stream).ok_or_else(|| {
            PlayerError::FormatError(format!("流 #{} 不是音视频/字幕流", stream.index()))
        })?;

        let codec_id = stream.parameters().id();
        let codec_name = ffmpeg::decoder::find(codec_id)
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| format!("{codec_id:?}"));

        let mut context = codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| PlayerError::FormatError(format!("流 #{}: {e}", stream.index())))?;

        #[cfg(feature = "hwaccel")]
        let hw_accelerated =
            track_type == TrackType::Video && crate::player::hw::try_attach_device(&mut context);
        #[cfg(not(feature = "hwaccel"))]
        let hw_accelerated = false;

        let avg_frame_rate = match track_type {
            TrackType::Video => {
                let r = stream.avg_frame_rate();
                (r.numerator() > 0 && r.denominator() > 0).then_some(r)
            }
            _ => None,
        };

        let info = Arc::new(CodecInfo {
            stream_index: stream.index(),
            track_type,
            time_base: stream.time_base(),
            avg_frame_rate,
            codec_name: codec_name.clone(),
            rotation,
            hw_accelerated,
        });

        let decoder = context.decoder();
        let context = match track_type {
            TrackType::Video => CodecContext::Video(
                decoder
                    .video()
                    .map_err(|e| PlayerError::FormatError(format!("打开视频解码器失败: {e}")))?,
            ),
            TrackType::Audio => CodecContext::Audio(
                decoder
                    .audio()
                    .map_err(|e| PlayerError::FormatError(format!("打开音频解码器失败: {e}")))?,
            ),
            TrackType::Subtitle => CodecContext::Subtitle(
                decoder
                    .subtitle()
                    .map_err(|e| PlayerError::FormatError(format!("打开字幕解码器失败: {e}")))?,
            ),
        };

        info!(
            "✅ 打开解码器: 流 #{} {} ({}){}",
            info.stream_index,
            info.track_type.as_str(),
            codec_name,
            if hw_accelerated { " [硬件加速]" } else { "" }
        );
        debug!(
            "    time_base={:?}, avg_frame_rate={:?}, rotation={}",
            info.time_base, info.avg_frame_rate, info.rotation
        );

        Ok(Self { context, info })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_info(time_base: Rational, rate: Option<Rational>) -> CodecInfo {
        CodecInfo::new(0, TrackType::Video, time_base, rate, "h264".into(), 0)
    }

    #[test]
    fn timestamp_conversion_rounds() {
        // 90kHz 时间基：1 tick = 11.11..µs
        let info = video_info(Rational::new(1, 90_000), None);
        assert_eq!(info.to_us(90_000), 1_000_000);
        assert_eq!(info.to_us(9), 100);
        // 0.5µs 向上取整
        assert_eq!(info.to_us(45_000), 500_000);
        assert_eq!(info.to_us(-90_000), -1_000_000);
    }

    #[test]
    fn timestamp_conversion_survives_large_values() {
        // 数小时的纳秒级时间基不允许中途溢出
        let info = video_info(Rational::new(1, 1_000_000_000), None);
        let ten_hours_ns: i64 = 36_000_000_000_000;
        assert_eq!(info.to_us(ten_hours_ns), 36_000_000_000);
    }

    #[test]
    fn frame_duration_from_rate() {
        let info = video_info(Rational::new(1, 90_000), Some(Rational::new(30_000, 1001)));
        // 29.97fps ≈ 33366µs
        assert_eq!(info.frame_duration_us(), Some(33_366));
        let info = video_info(Rational::new(1, 90_000), Some(Rational::new(25, 1)));
        assert_eq!(info.frame_duration_us(), Some(40_000));
        let info = video_info(Rational::new(1, 90_000), None);
        assert_eq!(info.frame_duration_us(), None);
    }

    #[test]
    fn zero_denominator_time_base() {
        let info = video_info(Rational::new(1, 0), None);
        assert_eq!(info.to_us(1234), 1234);
    }
}
