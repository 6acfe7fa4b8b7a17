use crate::core::{PlayerError, PlayerEvent, Result};
use crate::player::codec::Codec;
use crate::player::frame::Packet;
use crate::player::input::stream_rotation;
use crate::player::queue::MAX_QUEUE_BYTES;
use crate::player::stream_decoder::{StreamDecoder, StreamDecoderShared};
use crate::player::worker::{Worker, WorkerControl, WorkerHandle};
use crossbeam_channel::Sender;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{ffi, format};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 跳转后最多预读多少个包来确定实际落点
const SEEK_PROBE_PACKETS: usize = 64;

struct DemuxerShared {
    input: Mutex<format::context::Input>,
    streams: Mutex<HashMap<usize, StreamDecoder>>,
    /// 已到 EOF 或被要求停止读取
    stopped: AtomicBool,
    /// 最近一个有效包的时间戳（微秒），作为当前读取位置
    last_pts_us: AtomicI64,
    control: Arc<WorkerControl>,
    events: Sender<PlayerEvent>,
}

/// 解复用器：单线程按需读包，按流索引路由到各流解码器。
///
/// 背压：所有包队列合计超过字节预算、或每条活跃流都攒够了目标
/// 缓冲时长时挂起，消费端取包后唤醒。
pub struct Demuxer {
    shared: Arc<DemuxerShared>,
    worker: WorkerHandle,
}

impl Demuxer {
    /// 创建时处于停止状态，start_decoding 后才开始读包
    pub fn new(mut input: format::context::Input, events: Sender<PlayerEvent>) -> Self {
        // 未启用的流全部打上丢弃标记
        let stream_count = input.streams().count();
        for i in 0..stream_count {
            set_discard(&mut input, i, true);
        }

        let control = WorkerControl::new();
        let shared = Arc::new(DemuxerShared {
            input: Mutex::new(input),
            streams: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(true),
            last_pts_us: AtomicI64::new(0),
            control: control.clone(),
            events,
        });
        let worker = WorkerHandle::spawn_with(
            control,
            DemuxerWorker {
                shared: shared.clone(),
            },
        );
        Self { shared, worker }
    }

    /// 为一条容器流创建解码器并纳入路由。
    /// 打开失败只影响该条轨道（返回格式错误，调用方禁用该轨）。
    pub fn add_stream(&self, stream_index: usize) -> Result<Arc<StreamDecoderShared>> {
        let mut input = self.shared.input.lock();
        let codec = {
            let stream = input.stream(stream_index).ok_or_else(|| {
                PlayerError::FormatError(format!("流索引 {stream_index} 不存在"))
            })?;
            let rotation = stream_rotation(&stream);
            Codec::open(&stream, rotation)?
        };
        set_discard(&mut input, stream_index, false);
        drop(input);

        let decoder = StreamDecoder::new(codec, self.shared.control.clone());
        let shared = decoder.shared().clone();
        let mut streams = self.shared.streams.lock();
        if let Some(mut old) = streams.insert(stream_index, decoder) {
            warn!("流 #{stream_index} 已有解码器，替换之");
            old.kill();
        }
        drop(streams);
        self.shared.control.wake();
        Ok(shared)
    }

    /// 摘除一条流：解码线程终止，后续包直接丢弃
    pub fn remove_stream(&self, stream_index: usize) {
        let removed = self.shared.streams.lock().remove(&stream_index);
        if let Some(mut decoder) = removed {
            decoder.kill();
        }
        set_discard(&mut self.shared.input.lock(), stream_index, true);
        debug!("摘除流 #{stream_index}");
    }

    pub fn stream_shared(&self, stream_index: usize) -> Option<Arc<StreamDecoderShared>> {
        self.shared
            .streams
            .lock()
            .get(&stream_index)
            .map(|d| d.shared().clone())
    }

    /// 跳转。持输入锁冻结读取，先清空所有下游队列再移动容器游标，
    /// 保证跳转前后的包不会交错。返回实际落点（微秒）。
    pub fn seek(&self, pos_us: i64) -> Result<i64> {
        info!("⏩ Demuxer seek: {}ms", pos_us / 1000);
        let mut input = self.shared.input.lock();
        let streams = self.shared.streams.lock();
        for decoder in streams.values() {
            decoder.begin_flush();
        }

        input.seek(pos_us, ..pos_us)?;
        self.shared.stopped.store(false, Ordering::SeqCst);

        // 预读到第一个有效时间戳，作为实际落点上报
        let mut effective = pos_us;
        for _ in 0..SEEK_PROBE_PACKETS {
            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut input) {
                Ok(()) => {
                    if let Some(pts) = route_packet(&streams, packet) {
                        effective = pts;
                        break;
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    for decoder in streams.values() {
                        decoder.shared().push_eos();
                    }
                    self.shared.stopped.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    warn!("跳转后预读失败: {}", e);
                    break;
                }
            }
        }
        self.shared.last_pts_us.store(effective, Ordering::SeqCst);
        drop(streams);
        drop(input);
        self.shared.control.wake();
        Ok(effective)
    }

    pub fn start_decoding(&self) {
        self.shared.stopped.store(false, Ordering::SeqCst);
        self.shared.control.wake();
    }

    /// 停止读取并向所有流发结束哨兵（会话停止时调用）
    pub fn stop_decoding(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let streams = self.shared.streams.lock();
        for decoder in streams.values() {
            decoder.shared().push_eos();
        }
    }

    /// 当前读取位置（微秒）
    pub fn position_us(&self) -> i64 {
        self.shared.last_pts_us.load(Ordering::SeqCst)
    }

    pub fn kill(&mut self) {
        // 先停线程，再放掉各流解码器
        self.worker.kill();
        let mut streams = self.shared.streams.lock();
        for (_, mut decoder) in streams.drain() {
            decoder.kill();
        }
    }
}

impl Drop for Demuxer {
    fn drop(&mut self) {
        self.kill();
    }
}

/// 把包送进对应流的队列，返回换算出的 pts（微秒）。
/// 没有对应解码器的包直接丢弃。
fn route_packet(streams: &HashMap<usize, StreamDecoder>, packet: ffmpeg::Packet) -> Option<i64> {
    let index = packet.stream();
    let decoder = streams.get(&index)?;
    let shared = decoder.shared();
    let info = shared.info();
    let pts_us = packet
        .pts()
        .or_else(|| packet.dts())
        .map(|ts| info.to_us(ts));
    let duration_us = info.to_us(packet.duration().max(0));
    shared.push_packet(Packet::new(packet, index, pts_us, duration_us));
    pts_us
}

/// 设置容器流的丢弃标记，让 FFmpeg 在解复用层就跳过未启用的流
fn set_discard(input: &mut format::context::Input, stream_index: usize, discard: bool) {
    unsafe {
        let ctx = input.as_mut_ptr();
        if stream_index >= (*ctx).nb_streams as usize {
            return;
        }
        let stream = *(*ctx).streams.add(stream_index);
        (*stream).discard = if discard {
            ffi::AVDiscard::AVDISCARD_ALL
        } else {
            ffi::AVDiscard::AVDISCARD_DEFAULT
        };
    }
}

struct DemuxerWorker {
    shared: Arc<DemuxerShared>,
}

impl Worker for DemuxerWorker {
    fn name(&self) -> &'static str {
        "demuxer"
    }

    fn should_wait(&self) -> bool {
        let shared = &self.shared;
        if shared.stopped.load(Ordering::SeqCst) {
            return true;
        }
        let streams = shared.streams.lock();
        if streams.is_empty() {
            return true;
        }
        buffers_full(streams.values().map(|d| {
            let q = d.shared().packet_queue();
            (q.bytes(), q.buffered_enough())
        }))
    }

    fn loop_once(&mut self, _control: &WorkerControl) -> Option<Duration> {
        let mut packet = ffmpeg::Packet::empty();
        let result = {
            let mut input = self.shared.input.lock();
            packet.read(&mut input)
        };

        match result {
            Ok(()) => {
                let streams = self.shared.streams.lock();
                if let Some(pts) = route_packet(&streams, packet) {
                    self.shared.last_pts_us.store(pts, Ordering::SeqCst);
                }
                None
            }
            Err(ffmpeg::Error::Other { errno: 11 }) => {
                // 网络源暂时无数据
                Some(Duration::from_millis(10))
            }
            Err(ffmpeg::Error::Eof) => {
                info!("📄 Demuxer 到达文件末尾");
                self.finish_reading();
                None
            }
            Err(e) => {
                error!("❌ 读取包失败: {}", e);
                let _ = self
                    .shared
                    .events
                    .send(PlayerEvent::Error(format!("读取媒体数据失败: {e}")));
                self.finish_reading();
                None
            }
        }
    }
}

impl DemuxerWorker {
    /// EOF / 读错误：向每条流发结束哨兵并停止读取
    fn finish_reading(&self) {
        let streams = self.shared.streams.lock();
        for decoder in streams.values() {
            decoder.shared().push_eos();
        }
        self.shared.stopped.store(true, Ordering::SeqCst);
    }
}

/// 背压判定：字节预算用尽，或所有流都攒够目标缓冲
fn buffers_full(queues: impl Iterator<Item = (usize, bool)>) -> bool {
    let mut total_bytes = 0usize;
    let mut all_buffered = true;
    for (bytes, buffered) in queues {
        total_bytes += bytes;
        if !buffered {
            all_buffered = false;
        }
    }
    total_bytes >= MAX_QUEUE_BYTES || all_buffered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_on_byte_budget() {
        // 单独一条流塞满字节预算就要停
        assert!(buffers_full([(MAX_QUEUE_BYTES, false)].into_iter()));
        assert!(!buffers_full([(MAX_QUEUE_BYTES - 1, false)].into_iter()));
    }

    #[test]
    fn backpressure_needs_every_stream_buffered() {
        // 一条流攒够、另一条还饿着：继续读
        assert!(!buffers_full([(1024, true), (0, false)].into_iter()));
        // 全部攒够才挂起
        assert!(buffers_full([(1024, true), (2048, true)].into_iter()));
    }

    #[test]
    fn byte_budget_counts_across_streams() {
        let half = MAX_QUEUE_BYTES / 2;
        assert!(buffers_full([(half, false), (half, false)].into_iter()));
    }
}
