use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// 时钟来源类型，决定主时钟选举优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockType {
    Audio,
    Video,
}

/// 播放时钟控制器 - 音视频同步的唯一时间权威。
///
/// 所有渲染器通过 [`ClockController::register`] 领取一个 [`Clock`] 句柄；
/// 主时钟（优先音频，其次视频）通过 `time_updated` 驱动时间线，其余
/// 渲染器只读取。没有任何渲染器注册时，控制器用自身的单调计时器推进。
#[derive(Clone)]
pub struct ClockController {
    inner: Arc<Mutex<ControllerInner>>,
}

struct ControllerInner {
    base_time_us: i64,      // base_instant 时刻的媒体时间（微秒）
    base_instant: Instant,
    seek_time_us: i64,      // 最近一次 sync_to 的位置
    rate: f64,
    paused: bool,
    clocks: Vec<(u64, ClockType)>,
    master: Option<u64>,
    next_id: u64,
}

impl ControllerInner {
    fn current_time_us(&self) -> i64 {
        if self.paused {
            self.base_time_us
        } else {
            let elapsed = self.base_instant.elapsed().as_micros() as i64;
            self.base_time_us + (elapsed as f64 * self.rate) as i64
        }
    }

    /// 重新选举主时钟：第一个音频时钟优先，否则第一个视频时钟
    fn elect_master(&mut self) {
        self.master = self
            .clocks
            .iter()
            .find(|(_, k)| *k == ClockType::Audio)
            .or_else(|| self.clocks.iter().find(|(_, k)| *k == ClockType::Video))
            .map(|(id, _)| *id);
    }

    fn rebase(&mut self, time_us: i64) {
        self.base_time_us = time_us;
        self.base_instant = Instant::now();
    }
}

impl ClockController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ControllerInner {
                base_time_us: 0,
                base_instant: Instant::now(),
                seek_time_us: 0,
                rate: 1.0,
                paused: true,
                clocks: Vec::new(),
                master: None,
                next_id: 0,
            })),
        }
    }

    /// 当前播放时间（微秒）。暂停时冻结。
    pub fn current_time_us(&self) -> i64 {
        self.inner.lock().current_time_us()
    }

    /// 跳转后重置时间线到给定位置
    pub fn sync_to(&self, time_us: i64) {
        let mut inner = self.inner.lock();
        inner.rebase(time_us);
        inner.seek_time_us = time_us;
    }

    /// 最近一次跳转的目标位置，渲染器据此丢弃跳转前的旧帧
    pub fn seek_time_us(&self) -> i64 {
        self.inner.lock().seek_time_us
    }

    pub fn set_paused(&self, paused: bool) {
        let mut inner = self.inner.lock();
        if inner.paused == paused {
            return;
        }
        let now = inner.current_time_us();
        inner.rebase(now);
        inner.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// 切换倍速，保证时间线连续（当前时刻不跳变）
    pub fn set_playback_rate(&self, rate: f64) {
        let mut inner = self.inner.lock();
        let now = inner.current_time_us();
        inner.rebase(now);
        inner.rate = rate;
    }

    pub fn playback_rate(&self) -> f64 {
        self.inner.lock().rate
    }

    /// 从现在到给定显示时间还需等待的真实时间（微秒）。
    /// 已迟到的帧返回负值。
    pub fn usecs_to(&self, display_time_us: i64) -> i64 {
        let inner = self.inner.lock();
        let delta = display_time_us - inner.current_time_us();
        (delta as f64 / inner.rate) as i64
    }

    /// 注册一个时钟来源，返回渲染器持有的句柄。触发主时钟重新选举。
    pub fn register(&self, kind: ClockType) -> Clock {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.clocks.push((id, kind));
        inner.elect_master();
        log::debug!("⏱️ 注册{kind:?}时钟 id={id}, 主时钟={:?}", inner.master);
        Clock {
            controller: self.clone(),
            id,
        }
    }

    fn unregister(&self, id: u64) {
        let mut inner = self.inner.lock();
        inner.clocks.retain(|(cid, _)| *cid != id);
        inner.elect_master();
        log::debug!("⏱️ 注销时钟 id={id}, 主时钟={:?}", inner.master);
    }

    /// 主时钟上报最新播放位置；非主时钟的上报被忽略
    fn time_updated(&self, id: u64, time_us: i64) -> i64 {
        let mut inner = self.inner.lock();
        if inner.master == Some(id) && !inner.paused {
            inner.rebase(time_us);
        }
        inner.current_time_us()
    }

    fn is_master(&self, id: u64) -> bool {
        self.inner.lock().master == Some(id)
    }
}

impl Default for ClockController {
    fn default() -> Self {
        Self::new()
    }
}

/// 渲染器持有的时钟句柄。Drop 时自动注销并重新选举主时钟。
pub struct Clock {
    controller: ClockController,
    id: u64,
}

impl Clock {
    /// 上报播放位置（仅主时钟生效），返回控制器当前时间
    pub fn time_updated(&self, time_us: i64) -> i64 {
        self.controller.time_updated(self.id, time_us)
    }

    pub fn is_master(&self) -> bool {
        self.controller.is_master(self.id)
    }

    pub fn current_time_us(&self) -> i64 {
        self.controller.current_time_us()
    }

    pub fn seek_time_us(&self) -> i64 {
        self.controller.seek_time_us()
    }

    pub fn usecs_to(&self, display_time_us: i64) -> i64 {
        self.controller.usecs_to(display_time_us)
    }

    pub fn playback_rate(&self) -> f64 {
        self.controller.playback_rate()
    }

    pub fn is_paused(&self) -> bool {
        self.controller.is_paused()
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.controller.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn paused_clock_is_frozen() {
        let ctrl = ClockController::new();
        ctrl.sync_to(5_000_000);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ctrl.current_time_us(), 5_000_000);
    }

    #[test]
    fn running_clock_advances() {
        let ctrl = ClockController::new();
        ctrl.sync_to(0);
        ctrl.set_paused(false);
        std::thread::sleep(Duration::from_millis(50));
        let t = ctrl.current_time_us();
        assert!(t >= 40_000, "时钟应当前进: {t}");
    }

    #[test]
    fn pause_resume_is_continuous() {
        let ctrl = ClockController::new();
        ctrl.sync_to(1_000_000);
        ctrl.set_paused(false);
        std::thread::sleep(Duration::from_millis(30));
        ctrl.set_paused(true);
        let frozen = ctrl.current_time_us();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(ctrl.current_time_us(), frozen);
        ctrl.set_paused(false);
        let resumed = ctrl.current_time_us();
        assert!((resumed - frozen).abs() < 20_000);
    }

    #[test]
    fn rate_change_keeps_continuity() {
        let ctrl = ClockController::new();
        ctrl.sync_to(2_000_000);
        ctrl.set_paused(false);
        std::thread::sleep(Duration::from_millis(20));
        let before = ctrl.current_time_us();
        ctrl.set_playback_rate(2.0);
        let after = ctrl.current_time_us();
        assert!((after - before).abs() < 20_000, "倍速切换不应跳变: {before} -> {after}");
    }

    #[test]
    fn audio_clock_wins_election() {
        let ctrl = ClockController::new();
        let video = ctrl.register(ClockType::Video);
        assert!(video.is_master());
        let audio = ctrl.register(ClockType::Audio);
        assert!(audio.is_master());
        assert!(!video.is_master());
        // 音频时钟注销后主时钟退回视频
        drop(audio);
        assert!(video.is_master());
        drop(video);
        // 无主时钟时控制器自身计时
        ctrl.sync_to(0);
        ctrl.set_paused(false);
        std::thread::sleep(Duration::from_millis(20));
        assert!(ctrl.current_time_us() > 0);
    }

    #[test]
    fn non_master_updates_ignored() {
        let ctrl = ClockController::new();
        ctrl.sync_to(0);
        ctrl.set_paused(false);
        let audio = ctrl.register(ClockType::Audio);
        let video = ctrl.register(ClockType::Video);
        audio.time_updated(3_000_000);
        let t1 = ctrl.current_time_us();
        assert!(t1 >= 3_000_000);
        video.time_updated(9_000_000);
        let t2 = ctrl.current_time_us();
        assert!(t2 < 9_000_000, "非主时钟不应驱动时间线: {t2}");
    }

    #[test]
    fn usecs_to_respects_rate() {
        let ctrl = ClockController::new();
        ctrl.sync_to(1_000_000);
        ctrl.set_playback_rate(2.0);
        // 媒体时间还差 100ms，2 倍速下真实等待 50ms
        let wait = ctrl.usecs_to(1_100_000);
        assert!((wait - 50_000).abs() < 5_000, "wait={wait}");
        // 迟到的帧返回负值
        assert!(ctrl.usecs_to(500_000) < 0);
    }

    #[test]
    fn sync_to_sets_seek_point() {
        let ctrl = ClockController::new();
        ctrl.sync_to(7_500_000);
        assert_eq!(ctrl.seek_time_us(), 7_500_000);
        assert_eq!(ctrl.current_time_us(), 7_500_000);
    }

    #[test]
    fn sync_while_running_repositions_immediately() {
        let ctrl = ClockController::new();
        ctrl.sync_to(10_000_000);
        ctrl.set_paused(false);
        std::thread::sleep(Duration::from_millis(20));
        // 回跳：seek 点与当前时间同时落到目标，落点之后的帧
        // 既不会被当旧帧丢弃，也不会被判成迟到
        ctrl.sync_to(2_000_000);
        assert_eq!(ctrl.seek_time_us(), 2_000_000);
        let frame_end_us = 2_040_000;
        assert!(frame_end_us >= ctrl.seek_time_us());
        assert!(ctrl.usecs_to(frame_end_us) > 0);
    }
}
