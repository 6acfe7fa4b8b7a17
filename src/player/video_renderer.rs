use crate::core::{Clock, ColorRange, ColorSpace, ColorTransfer, VideoFrame};
use crate::player::frame::{Frame, FramePayload};
use crate::player::renderer::Renderer;
use crate::player::stream_decoder::StreamDecoderShared;
use crate::player::video_sink::VideoSink;
use crate::player::worker::{Worker, WorkerControl, WorkerHandle};
use ffmpeg_next::{ffi, software, util};
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct VideoRendererShared {
    stream: Mutex<Option<Arc<StreamDecoderShared>>>,
    subtitle_stream: Mutex<Option<Arc<StreamDecoderShared>>>,
    at_end: AtomicBool,
    control: Arc<WorkerControl>,
}

/// 视频渲染器：按时钟节拍取帧、转成 RGBA 交给接收端，
/// 并叠加当前区间内的字幕。
pub struct VideoRenderer {
    shared: Arc<VideoRendererShared>,
    worker: WorkerHandle,
}

impl VideoRenderer {
    pub fn new(sink: Arc<dyn VideoSink>, clock: Clock) -> Self {
        let control = WorkerControl::new();
        let shared = Arc::new(VideoRendererShared {
            stream: Mutex::new(None),
            subtitle_stream: Mutex::new(None),
            at_end: AtomicBool::new(false),
            control: control.clone(),
        });
        let worker = WorkerHandle::spawn_with(
            control,
            VideoRendererWorker {
                shared: shared.clone(),
                sink,
                clock,
                scaler: None,
                scaler_key: None,
                subtitle_end_us: None,
            },
        );
        Self { shared, worker }
    }

    /// 叠加字幕流（None 清除叠加）
    pub fn set_subtitle_stream(&self, stream: Option<Arc<StreamDecoderShared>>) {
        let mut guard = self.shared.subtitle_stream.lock();
        if let Some(old) = guard.take() {
            old.detach_renderer();
        }
        if let Some(s) = &stream {
            s.attach_renderer(self.shared.control.clone());
        }
        *guard = stream;
        drop(guard);
        self.shared.control.wake();
    }

    pub fn kill(&mut self) {
        self.worker.kill();
    }
}

impl Renderer for VideoRenderer {
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
        self.shared.control.wake();
    }

    fn set_paused(&self, paused: bool) {
        if paused {
            self.shared.control.request_pause();
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

struct VideoRendererWorker {
    shared: Arc<VideoRendererShared>,
    sink: Arc<dyn VideoSink>,
    clock: Clock,
    scaler: Option<software::scaling::Context>,
    scaler_key: Option<(util::format::Pixel, u32, u32)>,
    /// 正在显示的字幕的结束时间
    subtitle_end_us: Option<i64>,
}

// SwsContext 只在渲染线程中使用
unsafe impl Send for VideoRendererWorker {}

impl Worker for VideoRendererWorker {
    fn name(&self) -> &'static str {
        "video-renderer"
    }

    fn should_wait(&self) -> bool {
        let guard = self.shared.stream.lock();
        let Some(stream) = guard.as_ref() else {
            return true;
        };
        if stream.peek_frame().is_some() {
            return false;
        }
        // 播完状态需要跑一次循环去记录
        !(stream.at_end() && !self.shared.at_end.load(Ordering::SeqCst))
    }

    fn loop_once(&mut self, control: &WorkerControl) -> Option<Duration> {
        let stream = self.shared.stream.lock().clone()?;

        let Some(frame) = stream.peek_frame() else {
            if stream.at_end() && !self.shared.at_end.swap(true, Ordering::SeqCst) {
                debug!("🏁 视频流播放完毕");
            }
            return None;
        };

        // 跳转落点之前结束的旧帧直接丢弃
        let seek_time = self.clock.seek_time_us();
        if frame.end_us() < seek_time {
            stream.take_frame();
            return None;
        }

        // 按显示时刻定节拍；暂停单步时立即展示
        if !control.is_paused() {
            let wait = self.clock.usecs_to(frame.pts_us());
            if wait > 1_000 {
                return Some(Duration::from_micros(wait as u64));
            }
        }

        let frame = stream.take_frame()?;
        self.shared.at_end.store(false, Ordering::SeqCst);

        // 已整帧迟到且后面还有帧：丢弃追赶（末帧迟到也照常展示）
        if !control.is_paused()
            && frame.duration_us() > 0
            && self.clock.usecs_to(frame.end_us()) < 0
            && stream.peek_frame().is_some()
        {
            debug!("⏭️ 丢弃迟到帧 @ {} ms", frame.pts_us() / 1000);
            return None;
        }

        if let FramePayload::Video(avframe) = frame.payload() {
            match self.presentable(avframe, &frame, stream.info().rotation()) {
                Ok(video) => self.sink.set_video_frame(video),
                Err(e) => warn!("帧转换失败（已跳过）: {}", e),
            }
        }

        self.update_subtitle(frame.pts_us());
        control.done_step();
        self.clock.time_updated(frame.pts_us());

        // 下一帧的显示时刻决定下次醒来的时间
        if let Some(next) = stream.peek_frame() {
            let wait = self.clock.usecs_to(next.pts_us());
            if wait > 0 {
                return Some(Duration::from_micros(wait as u64));
            }
        } else if frame.duration_us() > 0 {
            return Some(Duration::from_micros(frame.duration_us() as u64));
        }
        None
    }
}

impl VideoRendererWorker {
    /// 解码帧 → 可展示的 RGBA 帧（必要时先从硬件表面回传）
    fn presentable(
        &mut self,
        avframe: &util::frame::Video,
        frame: &Frame,
        rotation: i32,
    ) -> crate::core::Result<VideoFrame> {
        #[cfg(feature = "hwaccel")]
        let transferred;
        #[cfg(feature = "hwaccel")]
        let avframe = if crate::player::hw::is_hw_frame(avframe) {
            transferred = crate::player::hw::transfer_to_cpu(avframe)?;
            &transferred
        } else {
            avframe
        };

        let width = avframe.width();
        let height = avframe.height();
        let key = (avframe.format(), width, height);
        if self.scaler_key != Some(key) {
            self.scaler = Some(software::scaling::Context::get(
                avframe.format(),
                width,
                height,
                util::format::Pixel::RGBA,
                width,
                height,
                software::scaling::Flags::BILINEAR,
            )?);
            self.scaler_key = Some(key);
        }

        let mut rgba = util::frame::Video::empty();
        self.scaler
            .as_mut()
            .expect("scaler 刚刚构建")
            .run(avframe, &mut rgba)?;

        // 紧凑拷贝（去掉行对齐 padding）
        let line_size = width as usize * 4;
        let mut data = vec![0u8; line_size * height as usize];
        let stride = rgba.stride(0);
        let src = rgba.data(0);
        for y in 0..height as usize {
            data[y * line_size..(y + 1) * line_size]
                .copy_from_slice(&src[y * stride..y * stride + line_size]);
        }

        Ok(VideoFrame {
            pts_us: frame.pts_us(),
            duration_us: frame.duration_us(),
            width,
            height,
            data,
            line_size,
            color_space: map_color_space(avframe.color_space()),
            color_transfer: color_transfer_of(avframe),
            color_range: map_color_range(avframe.color_range()),
            max_luminance: max_luminance_of(avframe),
            rotation,
        })
    }

    /// 推进字幕叠加：过期清除，进入区间则上字
    fn update_subtitle(&mut self, pts_us: i64) {
        let Some(sub) = self.shared.subtitle_stream.lock().clone() else {
            if self.subtitle_end_us.take().is_some() {
                self.sink.set_subtitle_text("");
            }
            return;
        };

        if let Some(end) = self.subtitle_end_us {
            if end <= pts_us {
                self.sink.set_subtitle_text("");
                self.subtitle_end_us = None;
            }
        }

        while let Some(frame) = sub.peek_frame() {
            if frame.end_us() <= pts_us {
                // 整个区间已过
                sub.take_frame();
                continue;
            }
            if frame.pts_us() <= pts_us {
                sub.take_frame();
                if let FramePayload::Subtitle(text) = frame.payload() {
                    self.sink.set_subtitle_text(text);
                    self.subtitle_end_us = (!text.is_empty()).then(|| frame.end_us());
                }
                continue;
            }
            break;
        }
    }
}

fn map_color_space(space: util::color::Space) -> ColorSpace {
    use util::color::Space;
    match space {
        Space::BT709 => ColorSpace::Bt709,
        Space::SMPTE170M | Space::BT470BG => ColorSpace::Bt601,
        Space::BT2020NCL | Space::BT2020CL => ColorSpace::Bt2020,
        _ => ColorSpace::Unknown,
    }
}

fn map_color_range(range: util::color::Range) -> ColorRange {
    use util::color::Range;
    match range {
        Range::MPEG => ColorRange::Limited,
        Range::JPEG => ColorRange::Full,
        _ => ColorRange::Unknown,
    }
}

fn color_transfer_of(frame: &util::frame::Video) -> ColorTransfer {
    let trc = unsafe { (*frame.as_ptr()).color_trc };
    match trc {
        ffi::AVColorTransferCharacteristic::AVCOL_TRC_SMPTE2084 => ColorTransfer::Pq,
        ffi::AVColorTransferCharacteristic::AVCOL_TRC_ARIB_STD_B67 => ColorTransfer::Hlg,
        ffi::AVColorTransferCharacteristic::AVCOL_TRC_UNSPECIFIED => ColorTransfer::Unknown,
        _ => ColorTransfer::Sdr,
    }
}

/// `AVMasteringDisplayMetadata`（libavutil/mastering_display_metadata.h）；
/// ffmpeg-sys-next 未绑定该头文件，这里按 C 布局声明
#[repr(C)]
struct AVMasteringDisplayMetadata {
    display_primaries: [[ffi::AVRational; 2]; 3],
    white_point: [ffi::AVRational; 2],
    min_luminance: ffi::AVRational,
    max_luminance: ffi::AVRational,
    has_primaries: std::os::raw::c_int,
    has_luminance: std::os::raw::c_int,
}

/// HDR 内容的峰值亮度（尼特），来自 mastering display 元数据
fn max_luminance_of(frame: &util::frame::Video) -> Option<f64> {
    unsafe {
        let side = ffi::av_frame_get_side_data(
            frame.as_ptr(),
            ffi::AVFrameSideDataType::AV_FRAME_DATA_MASTERING_DISPLAY_METADATA,
        );
        if side.is_null() {
            return None;
        }
        let meta = (*side).data as *const AVMasteringDisplayMetadata;
        if meta.is_null() || (*meta).has_luminance == 0 {
            return None;
        }
        let lum = (*meta).max_luminance;
        if lum.den == 0 {
            return None;
        }
        Some(lum.num as f64 / lum.den as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_space_mapping() {
        assert_eq!(map_color_space(util::color::Space::BT709), ColorSpace::Bt709);
        assert_eq!(map_color_space(util::color::Space::SMPTE170M), ColorSpace::Bt601);
        assert_eq!(map_color_space(util::color::Space::BT2020NCL), ColorSpace::Bt2020);
        assert_eq!(map_color_space(util::color::Space::RGB), ColorSpace::Unknown);
    }

    #[test]
    fn color_range_mapping() {
        assert_eq!(map_color_range(util::color::Range::MPEG), ColorRange::Limited);
        assert_eq!(map_color_range(util::color::Range::JPEG), ColorRange::Full);
        assert_eq!(
            map_color_range(util::color::Range::Unspecified),
            ColorRange::Unknown
        );
    }
}
