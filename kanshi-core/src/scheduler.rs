//! 周期タスクのスケジューラ
//!
//! 表示の間引きとウォッチドッグは [`Scheduler`] 経由でタイマーを使います。
//! 実運用では [`ThreadScheduler`]、テストでは時計を手動で進める
//! [`ManualScheduler`] を使います。

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::warn;

/// 周期タスク
pub type Task = Box<dyn FnMut() + Send>;

/// 周期タスクを登録するスケジューラ
pub trait Scheduler: Send + Sync {
    /// `period` ごとに `task` を実行する
    ///
    /// 返されたハンドルをキャンセル（またはドロップ）すると停止します。
    fn every(&self, period: Duration, task: Task) -> TaskHandle;
}

/// 周期タスクのハンドル
///
/// キャンセルは合図を送るだけで、タスクの終了は待ちません。
/// そのためタスク自身やトラップ通知の中からも安全に呼べます。
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
    wake: Option<Sender<()>>,
}

impl TaskHandle {
    fn new(cancelled: Arc<AtomicBool>, wake: Option<Sender<()>>) -> Self {
        Self { cancelled, wake }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(wake) = &self.wake {
            let _ = wake.try_send(());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// タスクごとにスレッドを1本使うスケジューラ
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadScheduler;

impl ThreadScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for ThreadScheduler {
    fn every(&self, period: Duration, mut task: Task) -> TaskHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (wake_tx, wake_rx) = bounded::<()>(1);
        let flag = Arc::clone(&cancelled);

        let spawned = thread::Builder::new()
            .name("kanshi-timer".to_string())
            .spawn(move || loop {
                match wake_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        if flag.load(Ordering::Acquire) {
                            break;
                        }
                        task();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn timer thread: {}", e);
            cancelled.store(true, Ordering::Release);
        }

        TaskHandle::new(cancelled, Some(wake_tx))
    }
}

struct ManualTask {
    period: Duration,
    next_due: Duration,
    cancelled: Arc<AtomicBool>,
    task: Arc<Mutex<Task>>,
}

/// 手動で時計を進めるスケジューラ（テスト用）
#[derive(Default)]
pub struct ManualScheduler {
    now: Mutex<Duration>,
    tasks: Mutex<Vec<ManualTask>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 開始からの経過時間
    pub fn now(&self) -> Duration {
        *self.now.lock()
    }

    /// キャンセルされていないタスクの数
    pub fn active_tasks(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::Acquire))
            .count()
    }

    /// 時計を `duration` 進め、期限の来たタスクを時刻順に実行する
    pub fn advance(&self, duration: Duration) {
        let target = self.now() + duration;
        loop {
            let due = {
                let mut tasks = self.tasks.lock();
                tasks.retain(|t| !t.cancelled.load(Ordering::Acquire));
                let next = tasks
                    .iter_mut()
                    .filter(|t| t.next_due <= target)
                    .min_by_key(|t| t.next_due);
                match next {
                    Some(next) => {
                        let at = next.next_due;
                        next.next_due += next.period;
                        Some((at, Arc::clone(&next.task), Arc::clone(&next.cancelled)))
                    }
                    None => None,
                }
            };

            let Some((at, task, cancelled)) = due else {
                break;
            };
            *self.now.lock() = at;
            if !cancelled.load(Ordering::Acquire) {
                let mut task = task.lock();
                (*task)();
            }
        }
        *self.now.lock() = target;
    }
}

impl Scheduler for ManualScheduler {
    fn every(&self, period: Duration, task: Task) -> TaskHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let period = period.max(Duration::from_millis(1));
        self.tasks.lock().push(ManualTask {
            period,
            next_due: self.now() + period,
            cancelled: Arc::clone(&cancelled),
            task: Arc::new(Mutex::new(task)),
        });
        TaskHandle::new(cancelled, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>) -> Task {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_manual_scheduler_runs_due_tasks() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let _handle = scheduler.every(Duration::from_millis(250), counter_task(&counter));

        scheduler.advance(Duration::from_millis(249));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        scheduler.advance(Duration::from_millis(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(scheduler.now(), Duration::from_millis(1250));
    }

    #[test]
    fn test_manual_scheduler_interleaves_periods() {
        let scheduler = ManualScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let fast = Arc::clone(&order);
        let _a = scheduler.every(
            Duration::from_millis(250),
            Box::new(move || fast.lock().push("fast")),
        );
        let slow = Arc::clone(&order);
        let _b = scheduler.every(
            Duration::from_millis(1000),
            Box::new(move || slow.lock().push("slow")),
        );

        scheduler.advance(Duration::from_millis(1000));
        assert_eq!(*order.lock(), vec!["fast", "fast", "fast", "fast", "slow"]);
    }

    #[test]
    fn test_cancel_stops_task() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.every(Duration::from_millis(100), counter_task(&counter));

        scheduler.advance(Duration::from_millis(100));
        handle.cancel();
        assert!(handle.is_cancelled());
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.active_tasks(), 0);
    }

    #[test]
    fn test_drop_cancels_task() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        drop(scheduler.every(Duration::from_millis(100), counter_task(&counter)));
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_thread_scheduler_ticks_until_cancelled() {
        let scheduler = ThreadScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.every(Duration::from_millis(5), counter_task(&counter));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(counter.load(Ordering::SeqCst) >= 3);

        handle.cancel();
        thread::sleep(Duration::from_millis(30));
        let after_cancel = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::SeqCst), after_cancel);
    }
}
