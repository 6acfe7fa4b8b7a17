//! 视频硬件解码支持（hwaccel feature）。
//!
//! 打开视频解码器时尝试为其挂载硬件设备上下文；解出的硬件表面帧
//! 在渲染前通过 [`transfer_to_cpu`] 回传到 CPU 内存再做像素转换。

use crate::core::Result;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::{codec, util};
use log::{debug, info, warn};

/// 硬件解码器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HWAccelType {
    DXVA2,        // Windows DirectX Video Acceleration 2
    D3D11VA,      // Windows Direct3D 11 (推荐)
    VAAPI,        // Linux Video Acceleration API
    VideoToolbox, // macOS VideoToolbox
    CUDA,         // NVIDIA CUDA
    QSV,          // Intel Quick Sync Video
}

impl HWAccelType {
    pub fn name(&self) -> &'static str {
        match self {
            HWAccelType::DXVA2 => "DXVA2",
            HWAccelType::D3D11VA => "D3D11VA",
            HWAccelType::VAAPI => "VAAPI",
            HWAccelType::VideoToolbox => "VideoToolbox",
            HWAccelType::CUDA => "CUDA",
            HWAccelType::QSV => "QSV",
        }
    }

    fn device_type(&self) -> ffi::AVHWDeviceType {
        match self {
            HWAccelType::DXVA2 => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_DXVA2,
            HWAccelType::D3D11VA => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA,
            HWAccelType::VAAPI => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
            HWAccelType::VideoToolbox => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX,
            HWAccelType::CUDA => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA,
            HWAccelType::QSV => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_QSV,
        }
    }

    /// 按平台优先级列出候选硬件加速方式
    pub fn detect_available() -> Vec<HWAccelType> {
        let mut available = Vec::new();

        #[cfg(target_os = "windows")]
        {
            available.push(HWAccelType::D3D11VA);
            available.push(HWAccelType::DXVA2);
        }

        #[cfg(target_os = "macos")]
        {
            available.push(HWAccelType::VideoToolbox);
        }

        #[cfg(target_os = "linux")]
        {
            available.push(HWAccelType::VAAPI);
        }

        // 跨平台
        available.push(HWAccelType::CUDA);
        available.push(HWAccelType::QSV);

        available
    }
}

/// 依次尝试候选硬件类型，成功则把设备上下文挂到解码上下文上。
/// 全部失败退回软解，不算错误。
pub fn try_attach_device(context: &mut codec::context::Context) -> bool {
    for accel in HWAccelType::detect_available() {
        unsafe {
            let mut device_ctx: *mut ffi::AVBufferRef = std::ptr::null_mut();
            let ret = ffi::av_hwdevice_ctx_create(
                &mut device_ctx,
                accel.device_type(),
                std::ptr::null(),
                std::ptr::null_mut(),
                0,
            );
            if ret < 0 {
                debug!("硬件设备 {} 不可用 ({ret})", accel.name());
                continue;
            }
            (*context.as_mut_ptr()).hw_device_ctx = device_ctx;
            info!("✅ 启用硬件解码: {}", accel.name());
            return true;
        }
    }
    debug!("未找到可用的硬件解码设备，使用软解");
    false
}

/// 是否为硬件表面帧（像素格式为硬件专用格式）
pub fn is_hw_frame(frame: &util::frame::Video) -> bool {
    matches!(
        frame.format(),
        util::format::Pixel::D3D11
            | util::format::Pixel::DXVA2_VLD
            | util::format::Pixel::VAAPI
            | util::format::Pixel::VIDEOTOOLBOX
            | util::format::Pixel::CUDA
            | util::format::Pixel::QSV
    )
}

/// 把硬件表面帧回传到 CPU 内存（av_hwframe_transfer_data）
pub fn transfer_to_cpu(hw_frame: &util::frame::Video) -> Result<util::frame::Video> {
    let mut sw_frame = util::frame::Video::empty();
    unsafe {
        let ret = ffi::av_hwframe_transfer_data(sw_frame.as_mut_ptr(), hw_frame.as_ptr(), 0);
        if ret < 0 {
            warn!("硬件帧回传失败 ({ret})");
            return Err(ffmpeg::Error::from(ret).into());
        }
        // 时间戳等属性不随 transfer 拷贝，需要单独带过去
        ffi::av_frame_copy_props(sw_frame.as_mut_ptr(), hw_frame.as_ptr());
    }
    Ok(sw_frame)
}
