use crate::player::stream_decoder::StreamDecoderShared;
use std::sync::Arc;

/// 渲染器的统一控制面。音/视频渲染器各自持有工作线程，
/// 管理器通过本接口暂停、单步、换流和查询播完状态。
pub trait Renderer {
    /// 接上/换掉消费的流（None 表示断开）
    fn set_stream(&self, stream: Option<Arc<StreamDecoderShared>>);

    /// 暂停只作用于渲染（解码流水线继续预缓冲）
    fn set_paused(&self, paused: bool);

    /// 暂停状态下精确推进一个展示单元
    fn single_step(&self);

    /// 接入的流已全部展示完毕
    fn is_at_end(&self) -> bool;

    /// 清除播完标记（跳转/重新起播后调用）
    fn reset_at_end(&self);
}
