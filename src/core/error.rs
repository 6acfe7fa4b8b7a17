use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 资源不可用（文件不存在、网络不可达、读取中断）
    #[error("资源错误: {0}")]
    ResourceError(String),

    /// 媒体格式无效或不受支持（容器损坏、找不到解码器）
    #[error("格式错误: {0}")]
    FormatError(String),

    /// 无权限访问资源
    #[error("访问被拒绝: {0}")]
    AccessDeniedError(String),

    #[error("解码错误: {0}")]
    DecodeError(String),

    #[error("音频输出错误: {0}")]
    AudioError(String),

    /// 在当前会话状态下不允许的操作
    #[error("状态错误: {0}")]
    InvalidState(String),
}

impl PlayerError {
    /// 将打开媒体时的 FFmpeg 错误归类为三大致命错误之一。
    /// 权限问题 → AccessDenied；数据/格式问题 → Format；其余 → Resource。
    pub fn classify_open(err: ffmpeg_next::Error, url: &str) -> PlayerError {
        use ffmpeg_next::Error as FE;
        match err {
            FE::Other { errno: libc::EACCES }
            | FE::Other { errno: libc::EPERM }
            | FE::HttpUnauthorized
            | FE::HttpForbidden => PlayerError::AccessDeniedError(format!("{url}: {err}")),
            FE::InvalidData | FE::DecoderNotFound | FE::DemuxerNotFound => {
                PlayerError::FormatError(format!("{url}: {err}"))
            }
            _ => PlayerError::ResourceError(format!("{url}: {err}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;

// 只用到两个 errno 常量，不值得引入整个 libc crate
mod libc {
    pub const EACCES: i32 = 13;
    pub const EPERM: i32 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg_next::Error as FE;

    #[test]
    fn classify_access_denied() {
        let e = PlayerError::classify_open(FE::Other { errno: libc::EACCES }, "/root/secret.mp4");
        assert!(matches!(e, PlayerError::AccessDeniedError(_)));
    }

    #[test]
    fn classify_format() {
        let e = PlayerError::classify_open(FE::InvalidData, "bad.bin");
        assert!(matches!(e, PlayerError::FormatError(_)));
        let e = PlayerError::classify_open(FE::DecoderNotFound, "exotic.mkv");
        assert!(matches!(e, PlayerError::FormatError(_)));
    }

    #[test]
    fn classify_resource_fallback() {
        let e = PlayerError::classify_open(FE::Eof, "http://example.com/a.ts");
        assert!(matches!(e, PlayerError::ResourceError(_)));
    }
}
