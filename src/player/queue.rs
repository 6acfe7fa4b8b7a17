use crate::player::frame::{Frame, Packet};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// 所有包队列合计的字节上限
pub const MAX_QUEUE_BYTES: usize = 16 * 1024 * 1024;
/// 单条流的目标缓冲时长（微秒）
pub const BUFFER_TARGET_US: i64 = 200_000;
/// 视频/字幕帧队列深度
pub const VIDEO_FRAME_QUEUE_DEPTH: usize = 3;
/// 音频帧队列深度（帧短，需要更深的队列兜住调度抖动）
pub const AUDIO_FRAME_QUEUE_DEPTH: usize = 9;

/// 压缩包队列。字节数与时长增量维护，O(1) 查询，供背压判断使用。
pub struct PacketQueue {
    inner: Mutex<PacketQueueInner>,
}

struct PacketQueueInner {
    queue: VecDeque<Packet>,
    bytes: usize,
    duration_us: i64,
    /// 流结束哨兵：置位后队列排空即视为该流解码完毕
    eos: bool,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PacketQueueInner {
                queue: VecDeque::new(),
                bytes: 0,
                duration_us: 0,
                eos: false,
            }),
        }
    }

    pub fn push(&self, packet: Packet) {
        let mut inner = self.inner.lock();
        inner.bytes += packet.size();
        inner.duration_us += packet.duration_us();
        inner.queue.push_back(packet);
    }

    /// 放入流结束哨兵
    pub fn push_eos(&self) {
        self.inner.lock().eos = true;
    }

    pub fn take(&self) -> Option<Packet> {
        let mut inner = self.inner.lock();
        let packet = inner.queue.pop_front()?;
        inner.bytes -= packet.size();
        inner.duration_us -= packet.duration_us();
        Some(packet)
    }

    /// 清空全部待解码数据并撤销结束哨兵（跳转时调用）
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.bytes = 0;
        inner.duration_us = 0;
        inner.eos = false;
    }

    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    pub fn duration_us(&self) -> i64 {
        self.inner.lock().duration_us
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn has_eos(&self) -> bool {
        self.inner.lock().eos
    }

    /// 队列排空且收到结束哨兵
    pub fn drained(&self) -> bool {
        let inner = self.inner.lock();
        inner.eos && inner.queue.is_empty()
    }

    /// 缓冲是否已达标（到达 EOS 的流不再需要喂入，同样视为达标）
    pub fn buffered_enough(&self) -> bool {
        let inner = self.inner.lock();
        inner.eos || inner.duration_us >= BUFFER_TARGET_US
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// 深度受限的已解码帧队列
pub struct FrameQueue {
    inner: Mutex<VecDeque<Frame>>,
    max_len: usize,
}

impl FrameQueue {
    pub fn new(max_len: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(max_len)),
            max_len,
        }
    }

    /// 调用方须先用 is_full 判断；满时仍会入队（生产者的
    /// should_wait 保证正常情况下不会发生）
    pub fn push(&self, frame: Frame) {
        self.inner.lock().push_back(frame);
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().len() >= self.max_len
    }

    pub fn take(&self) -> Option<Frame> {
        self.inner.lock().pop_front()
    }

    /// 查看队首但不消费（帧是 Arc 共享的，克隆零拷贝）
    pub fn peek(&self) -> Option<Frame> {
        self.inner.lock().front().cloned()
    }

    /// 队首满足条件时弹出
    pub fn pop_front_if(&self, pred: impl FnOnce(&Frame) -> bool) -> Option<Frame> {
        let mut inner = self.inner.lock();
        if pred(inner.front()?) {
            inner.pop_front()
        } else {
            None
        }
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::frame::subtitle_frame;
    use ffmpeg_next as ffmpeg;

    fn packet(bytes: usize, duration_us: i64) -> Packet {
        Packet::new(ffmpeg::Packet::new(bytes), 0, Some(0), duration_us)
    }

    #[test]
    fn packet_accounting_is_exact() {
        let q = PacketQueue::new();
        q.push(packet(1000, 40_000));
        q.push(packet(500, 20_000));
        q.push(packet(250, 10_000));
        assert_eq!(q.bytes(), 1750);
        assert_eq!(q.duration_us(), 70_000);

        q.take();
        assert_eq!(q.bytes(), 750);
        assert_eq!(q.duration_us(), 30_000);

        q.clear();
        assert_eq!(q.bytes(), 0);
        assert_eq!(q.duration_us(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn eos_survives_drain_but_not_clear() {
        let q = PacketQueue::new();
        q.push(packet(100, 1_000));
        q.push_eos();
        assert!(!q.drained());
        q.take();
        assert!(q.drained());
        assert!(q.buffered_enough());
        q.clear();
        assert!(!q.has_eos());
        assert!(!q.drained());
    }

    #[test]
    fn buffered_enough_threshold() {
        let q = PacketQueue::new();
        q.push(packet(100, BUFFER_TARGET_US - 1));
        assert!(!q.buffered_enough());
        q.push(packet(100, 1));
        assert!(q.buffered_enough());
    }

    #[test]
    fn frame_queue_depth_and_order() {
        let q = FrameQueue::new(VIDEO_FRAME_QUEUE_DEPTH);
        for i in 0..VIDEO_FRAME_QUEUE_DEPTH as i64 {
            assert!(!q.is_full());
            q.push(subtitle_frame("x", i * 1000, 1000));
        }
        assert!(q.is_full());
        assert_eq!(q.peek().map(|f| f.pts_us()), Some(0));
        assert_eq!(q.take().map(|f| f.pts_us()), Some(0));
        assert!(!q.is_full());
    }

    #[test]
    fn pop_front_if_checks_head() {
        let q = FrameQueue::new(4);
        q.push(subtitle_frame("a", 0, 1000));
        q.push(subtitle_frame("b", 1000, 1000));
        assert!(q.pop_front_if(|f| f.pts_us() == 999).is_none());
        assert_eq!(q.len(), 2);
        assert!(q.pop_front_if(|f| f.pts_us() == 0).is_some());
        assert_eq!(q.peek().map(|f| f.pts_us()), Some(1000));
    }
}
