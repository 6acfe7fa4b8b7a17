use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 流水线工作线程的统一循环协议。
///
/// 关键约束：所有阻塞只发生在等待阶段（条件变量），`loop_once` 本身
/// 绝不阻塞。队列满、队列空、暂停等情况都通过 `should_wait` / 返回的
/// 超时表达，由运行循环统一等待，这样 `kill()` / `wake()` 总能及时生效。
pub trait Worker: Send + 'static {
    fn name(&self) -> &'static str {
        "worker"
    }

    /// 线程启动后、进入循环前调用一次
    fn init(&mut self) {}

    /// 线程退出前调用一次
    fn cleanup(&mut self) {}

    /// 当前没有可做的工作时返回 true（运行循环会等待 wake）。
    /// 调用时不持有控制锁，实现里可以安全地拿队列锁。
    fn should_wait(&self) -> bool;

    /// 执行一个工作单元。返回 Some(d) 表示下一个单元最多推迟 d
    /// （被 wake 会提前），返回 None 表示立即继续。
    fn loop_once(&mut self, control: &WorkerControl) -> Option<Duration>;
}

struct ControlState {
    exit: bool,
    paused: bool,
    step: bool,
    notified: bool,
}

/// 工作线程的控制句柄，生产者/管理器通过它唤醒、暂停、单步、终止线程。
pub struct WorkerControl {
    state: Mutex<ControlState>,
    cond: Condvar,
}

impl WorkerControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ControlState {
                exit: false,
                paused: false,
                step: false,
                notified: false,
            }),
            cond: Condvar::new(),
        })
    }

    /// 唤醒线程并强制重新评估所有等待条件。
    /// notified 标记保证与 should_wait 检查之间不会丢失唤醒。
    pub fn wake(&self) {
        let mut state = self.state.lock();
        state.notified = true;
        self.cond.notify_all();
    }

    /// 请求线程退出（协作式）。调用方随后 join。
    pub fn kill(&self) {
        let mut state = self.state.lock();
        state.exit = true;
        state.notified = true;
        self.cond.notify_all();
    }

    pub fn request_pause(&self) {
        self.state.lock().paused = true;
    }

    pub fn request_unpause(&self) {
        {
            let mut state = self.state.lock();
            state.paused = false;
            state.notified = true;
        }
        self.cond.notify_all();
    }

    /// 暂停状态下请求执行恰好一个工作单元。
    /// 工作单元完成后由实现调用 done_step 消费该请求。
    pub fn request_single_step(&self) {
        {
            let mut state = self.state.lock();
            state.step = true;
            state.notified = true;
        }
        self.cond.notify_all();
    }

    pub fn done_step(&self) {
        self.state.lock().step = false;
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn is_exiting(&self) -> bool {
        self.state.lock().exit
    }

    pub fn step_pending(&self) -> bool {
        self.state.lock().step
    }
}

/// 拥有一个工作线程；Drop 时协作终止并 join。
pub struct WorkerHandle {
    control: Arc<WorkerControl>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// 用外部创建的控制句柄启动线程（共享状态通常在 spawn 前就要持有它）
    pub fn spawn_with<W: Worker>(control: Arc<WorkerControl>, worker: W) -> Self {
        let name = worker.name();
        let thread_control = control.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(worker, thread_control))
            .expect("spawn 工作线程失败");
        Self {
            control,
            handle: Some(handle),
        }
    }

    pub fn spawn<W: Worker>(worker: W) -> Self {
        Self::spawn_with(WorkerControl::new(), worker)
    }

    pub fn control(&self) -> &Arc<WorkerControl> {
        &self.control
    }

    /// 终止并等待线程退出。幂等。
    pub fn kill(&mut self) {
        self.control.kill();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

fn run<W: Worker>(mut worker: W, control: Arc<WorkerControl>) {
    info!("{} 🧵 工作线程启动: {}", log_ctx(), worker.name());
    worker.init();

    // 上一个工作单元要求的最大推迟时间
    let mut pending_timeout: Option<Duration> = None;

    loop {
        // 不持控制锁评估工作条件（实现里会拿队列锁，
        // 而生产者持队列锁时会调用 wake 拿控制锁）
        let blocked = worker.should_wait();

        let mut state = control.state.lock();
        if state.exit {
            break;
        }
        if state.notified {
            // 条件可能已变化，清掉超时重新评估
            state.notified = false;
            pending_timeout = None;
            continue;
        }

        let paused_block = state.paused && !state.step;
        if blocked || paused_block {
            match pending_timeout.take() {
                Some(t) => {
                    let _ = control.cond.wait_for(&mut state, t);
                }
                None => control.cond.wait(&mut state),
            }
            continue;
        }

        if let Some(t) = pending_timeout.take() {
            // 节拍等待：到点或被唤醒后都重新走一遍条件评估
            let _ = control.cond.wait_for(&mut state, t);
            continue;
        }

        drop(state);
        pending_timeout = worker.loop_once(&control).filter(|t| !t.is_zero());
    }

    worker.cleanup();
    debug!("{} 🛑 工作线程退出: {}", log_ctx(), worker.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct Ticker {
        count: Arc<AtomicUsize>,
        idle: Arc<std::sync::atomic::AtomicBool>,
        delay: Option<Duration>,
        consume_step: bool,
    }

    impl Worker for Ticker {
        fn name(&self) -> &'static str {
            "ticker"
        }

        fn should_wait(&self) -> bool {
            self.idle.load(Ordering::SeqCst)
        }

        fn loop_once(&mut self, control: &WorkerControl) -> Option<Duration> {
            self.count.fetch_add(1, Ordering::SeqCst);
            if self.consume_step {
                control.done_step();
            }
            self.delay
        }
    }

    fn ticker(delay: Option<Duration>) -> (WorkerHandle, Arc<AtomicUsize>, Arc<std::sync::atomic::AtomicBool>) {
        let count = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let handle = WorkerHandle::spawn(Ticker {
            count: count.clone(),
            idle: idle.clone(),
            delay,
            consume_step: true,
        });
        (handle, count, idle)
    }

    #[test]
    fn kill_joins_promptly() {
        let (mut handle, count, _) = ticker(Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        handle.kill();
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(count.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn idle_worker_blocks_until_woken() {
        let (handle, count, idle) = ticker(Some(Duration::from_millis(1)));
        idle.store(true, Ordering::SeqCst);
        handle.control().wake();
        std::thread::sleep(Duration::from_millis(30));
        let settled = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        // 空闲期间计数不再增长
        assert_eq!(count.load(Ordering::SeqCst), settled);
        idle.store(false, Ordering::SeqCst);
        handle.control().wake();
        std::thread::sleep(Duration::from_millis(30));
        assert!(count.load(Ordering::SeqCst) > settled);
    }

    #[test]
    fn pause_then_single_step_runs_one_unit() {
        let (handle, count, _) = ticker(None);
        handle.control().request_pause();
        handle.control().wake();
        std::thread::sleep(Duration::from_millis(20));
        let paused_at = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), paused_at);

        handle.control().request_single_step();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), paused_at + 1);

        handle.control().request_unpause();
        std::thread::sleep(Duration::from_millis(20));
        assert!(count.load(Ordering::SeqCst) > paused_at + 1);
    }

    #[test]
    fn timeout_paces_iterations() {
        let (handle, count, _) = ticker(Some(Duration::from_millis(20)));
        std::thread::sleep(Duration::from_millis(100));
        let n = count.load(Ordering::SeqCst);
        // 20ms 节拍下 100ms 内不应跑出几百次
        assert!(n >= 2 && n <= 10, "n={n}");
        drop(handle);
    }
}
