use crate::core::{MediaInfo, PlayerError, Result, TrackInfo, TrackType};
use crate::player::codec::track_type_of;
use crossbeam_channel::{bounded, Receiver};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::format;
use log::{debug, info, warn};
use std::thread;

/// 打开媒体源。网络流附加稳定性选项，错误按资源/格式/权限归类。
pub fn open_input(url: &str) -> Result<format::context::Input> {
    info!("正在打开媒体: {}", url);

    let is_network = url.starts_with("http://")
        || url.starts_with("https://")
        || url.starts_with("rtsp://")
        || url.starts_with("rtmp://")
        || url.contains(".m3u8");

    let result = if is_network {
        info!("🌐 检测到网络流，应用优化选项");

        let mut options = ffmpeg::Dictionary::new();
        // discardcorrupt: 丢弃损坏的帧
        // genpts: 补全缺失的 PTS
        // nobuffer: 减少缓冲延迟
        options.set("fflags", "+discardcorrupt+genpts+nobuffer");
        options.set("analyzeduration", "5000000");
        options.set("probesize", "10000000");
        options.set("timeout", "15000000");
        options.set("rw_timeout", "8000000");
        options.set("reconnect", "1");
        options.set("reconnect_streamed", "1");
        options.set("reconnect_delay_max", "4");

        // HLS 特定选项
        if url.contains(".m3u8") {
            options.set("live_start_index", "-1");
            options.set("max_reload", "10");
            options.set("http_persistent", "1");
        }

        format::input_with_dictionary(&url, options)
    } else {
        format::input(&url)
    };

    result.map_err(|e| PlayerError::classify_open(e, url))
}

/// 枚举轨道、时长与元数据
pub fn probe_media(input: &format::context::Input, url: &str) -> MediaInfo {
    let mut info = MediaInfo {
        url: url.to_string(),
        is_seekable: is_seekable(input),
        ..MediaInfo::default()
    };

    for stream in input.streams() {
        let Some(track_type) = track_type_of(&stream) else {
            continue;
        };
        let params = stream.parameters();
        let codec_name = ffmpeg::decoder::find(params.id())
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| format!("{:?}", params.id()));
        let meta = stream.metadata();
        let track = TrackInfo {
            stream_index: stream.index(),
            track_type,
            codec_name,
            language: meta.get("language").map(str::to_string),
            title: meta.get("title").map(str::to_string),
            is_default: stream
                .disposition()
                .contains(format::stream::Disposition::DEFAULT),
        };
        match track_type {
            TrackType::Video => info.video_tracks.push(track),
            TrackType::Audio => info.audio_tracks.push(track),
            TrackType::Subtitle => info.subtitle_tracks.push(track),
        }
    }

    for (key, value) in input.metadata().iter() {
        info.metadata.insert(key.to_string(), value.to_string());
    }
    augment_metadata(input, &mut info);

    info.duration_us = probe_duration_us(input, &info);

    debug!(
        "媒体信息: {}条视频/{}条音频/{}条字幕, 时长 {}ms, seekable={}",
        info.video_tracks.len(),
        info.audio_tracks.len(),
        info.subtitle_tracks.len(),
        info.duration_us / 1000,
        info.is_seekable
    );
    info
}

/// 默认轨道：容器标记的 default 优先，否则取第一条
pub fn default_stream(info: &MediaInfo, track_type: TrackType) -> Option<usize> {
    let tracks = info.tracks(track_type);
    tracks
        .iter()
        .find(|t| t.is_default)
        .or_else(|| tracks.first())
        .map(|t| t.stream_index)
}

/// 从流参数派生出的汇总信息（分辨率、帧率、码率），补进元数据表
fn augment_metadata(input: &format::context::Input, info: &mut MediaInfo) {
    let bit_rate = input.bit_rate();
    if bit_rate > 0 {
        info.metadata
            .insert("bit_rate".to_string(), bit_rate.to_string());
    }

    for stream in input.streams() {
        if track_type_of(&stream) != Some(TrackType::Video) {
            continue;
        }
        unsafe {
            let par = (*stream.as_ptr()).codecpar;
            if !par.is_null() && (*par).width > 0 && (*par).height > 0 {
                info.metadata.insert(
                    "video.resolution".to_string(),
                    format!("{}x{}", (*par).width, (*par).height),
                );
            }
        }
        let rate = stream.avg_frame_rate();
        if rate.numerator() > 0 && rate.denominator() > 0 {
            info.metadata.insert(
                "video.frame_rate".to_string(),
                format!(
                    "{:.3}",
                    rate.numerator() as f64 / rate.denominator() as f64
                ),
            );
        }
        break;
    }
}

/// 时长优先级：流自带时长 → 容器时长 → 元数据 DURATION 标签
fn probe_duration_us(input: &format::context::Input, info: &MediaInfo) -> i64 {
    let stream_duration = input
        .streams()
        .filter_map(|s| {
            let d = s.duration();
            if d <= 0 {
                return None;
            }
            let tb = s.time_base();
            if tb.denominator() == 0 {
                return None;
            }
            Some(
                (1_000_000i128 * d as i128 * tb.numerator() as i128 / tb.denominator() as i128)
                    as i64,
            )
        })
        .max()
        .unwrap_or(0);
    if stream_duration > 0 {
        return stream_duration;
    }

    // format::context::Input::duration 已是 AV_TIME_BASE（微秒）
    let container = input.duration();
    if container > 0 {
        return container;
    }

    info.metadata
        .get("DURATION")
        .or_else(|| info.metadata.get("duration"))
        .and_then(|s| parse_duration_tag(s))
        .unwrap_or(0)
}

/// 解析 "HH:MM:SS.fraction" 形式的时长标签（Matroska 常见）
fn parse_duration_tag(tag: &str) -> Option<i64> {
    let mut parts = tag.trim().splitn(3, ':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if !(0.0..3600.0).contains(&seconds) || minutes < 0 || hours < 0 {
        return None;
    }
    Some(hours * 3_600_000_000 + minutes * 60_000_000 + (seconds * 1_000_000.0) as i64)
}

fn is_seekable(input: &format::context::Input) -> bool {
    unsafe {
        let ctx = input.as_ptr();
        let pb = (*ctx).pb;
        !pb.is_null() && (*pb).seekable != 0
    }
}

/// 从容器的 display matrix 侧数据取顺时针旋转角
pub fn stream_rotation(stream: &format::stream::Stream) -> i32 {
    for side in stream.side_data() {
        if side.kind() == ffmpeg::packet::side_data::Type::DisplayMatrix {
            let data = side.data();
            if data.len() >= 36 {
                let mut matrix = [0i32; 9];
                for (i, chunk) in data.chunks_exact(4).take(9).enumerate() {
                    matrix[i] = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
                return rotation_from_display_matrix(&matrix);
            }
        }
    }
    0
}

/// 等价于 av_display_rotation_get + 顺时针归一化到 [0, 360)
fn rotation_from_display_matrix(matrix: &[i32; 9]) -> i32 {
    let conv = |v: i32| v as f64 / 65536.0;
    let scale0 = (conv(matrix[0]).powi(2) + conv(matrix[3]).powi(2)).sqrt();
    let scale1 = (conv(matrix[1]).powi(2) + conv(matrix[4]).powi(2)).sqrt();
    if scale0 == 0.0 || scale1 == 0.0 {
        return 0;
    }
    let ccw = -(conv(matrix[1]) / scale1).atan2(conv(matrix[0]) / scale0).to_degrees();
    let cw = -(ccw.round() as i32);
    ((cw % 360) + 360) % 360
}

/// 打开完成的媒体：容器上下文 + 探测到的信息
pub struct OpenedMedia {
    pub input: format::context::Input,
    pub info: MediaInfo,
}

// 容器上下文整体移交接收方，打开线程不再触碰
unsafe impl Send for OpenedMedia {}

/// 后台线程打开媒体。慢速网络源不会卡住调用方，
/// 丢弃 MediaOpener 即放弃本次打开。
pub struct MediaOpener {
    receiver: Receiver<Result<OpenedMedia>>,
}

impl MediaOpener {
    pub fn spawn(url: String) -> Self {
        let (tx, rx) = bounded(1);
        thread::Builder::new()
            .name("media-opener".to_string())
            .spawn(move || {
                let result = open_input(&url).map(|input| {
                    let info = probe_media(&input, &url);
                    OpenedMedia { input, info }
                });
                if tx.send(result).is_err() {
                    warn!("打开结果无人接收（调用方已放弃）: {url}");
                }
            })
            .expect("spawn 打开线程失败");
        Self { receiver: rx }
    }

    /// 非阻塞查询结果
    pub fn try_result(&self) -> Option<Result<OpenedMedia>> {
        self.receiver.try_recv().ok()
    }

    /// 阻塞等待打开完成
    pub fn wait(self) -> Result<OpenedMedia> {
        self.receiver
            .recv()
            .map_err(|_| PlayerError::ResourceError("打开线程异常退出".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_tag_parses_matroska_style() {
        assert_eq!(parse_duration_tag("01:02:03.500000000"), Some(3_723_500_000));
        assert_eq!(parse_duration_tag("00:00:10.0"), Some(10_000_000));
        assert_eq!(parse_duration_tag("garbage"), None);
        assert_eq!(parse_duration_tag("10:61:00.0"), Some(10 * 3_600_000_000 + 61 * 60_000_000));
    }

    #[test]
    fn rotation_identity_is_zero() {
        // 单位矩阵（16.16 定点）
        let m = [65536, 0, 0, 0, 65536, 0, 0, 0, 1 << 30];
        assert_eq!(rotation_from_display_matrix(&m), 0);
    }

    #[test]
    fn rotation_quarter_turns() {
        // 顺时针 90°：竖拍手机视频的典型矩阵
        let m = [0, 65536, 0, -65536, 0, 0, 0, 0, 1 << 30];
        assert_eq!(rotation_from_display_matrix(&m), 90);
        // 180°
        let m = [-65536, 0, 0, 0, -65536, 0, 0, 0, 1 << 30];
        assert_eq!(rotation_from_display_matrix(&m), 180);
        // 270°
        let m = [0, -65536, 0, 65536, 0, 0, 0, 0, 1 << 30];
        assert_eq!(rotation_from_display_matrix(&m), 270);
    }

    #[test]
    fn degenerate_matrix_is_zero() {
        assert_eq!(rotation_from_display_matrix(&[0; 9]), 0);
    }

    fn audio_track(index: usize, is_default: bool) -> TrackInfo {
        TrackInfo {
            stream_index: index,
            track_type: TrackType::Audio,
            codec_name: "aac".into(),
            language: None,
            title: None,
            is_default,
        }
    }

    #[test]
    fn default_track_prefers_disposition_flag() {
        let mut info = MediaInfo::default();
        info.audio_tracks.push(audio_track(1, false));
        info.audio_tracks.push(audio_track(2, true));
        assert_eq!(default_stream(&info, TrackType::Audio), Some(2));
    }

    #[test]
    fn default_track_falls_back_to_first() {
        let mut info = MediaInfo::default();
        info.audio_tracks.push(audio_track(3, false));
        info.audio_tracks.push(audio_track(4, false));
        assert_eq!(default_stream(&info, TrackType::Audio), Some(3));
        // 该类型没有轨道则不启用
        assert_eq!(default_stream(&info, TrackType::Video), None);
    }
}
