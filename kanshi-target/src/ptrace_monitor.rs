//! ptrace によるトラップソース（Linux x86-64）
//!
//! ハードウェアブレークポイント方式のみ対応します。ページガード方式は
//! 対象プロセス内の例外ハンドラが必要なため、ptrace からは設定できません。

use crate::breakpoint::HardwareWatch;
use crate::memory::Memory;
use crate::monitor::{EndReason, TrapHandler, TrapSource};
use crate::process::{Process, StopReason};
use crate::registers::Registers;
use crate::rewind;
use crate::slots::{SlotPool, SlotReservation};
use crate::thread::ThreadId;
use crate::watch::{ArmFailure, InterceptionMode, WatchSpec};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// イベントがないときの待機間隔
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// 監視スレッドへの制御メッセージ
enum Control {
    Stop,
}

/// 監視スレッドの終了理由
enum LoopExit {
    Stopped,
    TargetLost(EndReason),
}

struct Worker {
    control: Sender<Control>,
    handle: JoinHandle<()>,
}

/// ptrace とデバッグレジスタによるトラップソース
pub struct PtraceMonitor {
    pid: i32,
    slots: SlotPool,
    worker: Option<Worker>,
    hits: Arc<AtomicU64>,
    armed: Arc<AtomicBool>,
    mode: Option<InterceptionMode>,
    last_failure: Option<String>,
}

impl PtraceMonitor {
    /// 新しいトラップソースを作成する
    ///
    /// `slots` はプロセス全体で共有するデバッグレジスタのプールです。
    pub fn new(pid: i32, slots: SlotPool) -> Self {
        Self {
            pid,
            slots,
            worker: None,
            hits: Arc::new(AtomicU64::new(0)),
            armed: Arc::new(AtomicBool::new(false)),
            mode: None,
            last_failure: None,
        }
    }

    /// 対象プロセスID
    pub fn pid(&self) -> i32 {
        self.pid
    }

    fn fail(&mut self, failure: ArmFailure) -> Result<(), ArmFailure> {
        warn!(pid = self.pid, %failure, "Arming failed");
        self.last_failure = Some(failure.to_string());
        Err(failure)
    }

    /// 対象の喪失で終わった監視スレッドを回収する
    fn reap(&mut self) {
        if self
            .worker
            .as_ref()
            .is_some_and(|worker| worker.handle.is_finished())
        {
            self.stop();
        }
    }
}

impl TrapSource for PtraceMonitor {
    fn start_page_guard(
        &mut self,
        _spec: &WatchSpec,
        _handler: Arc<dyn TrapHandler>,
    ) -> Result<(), ArmFailure> {
        self.reap();
        if self.worker.is_some() {
            return self.fail(ArmFailure::AlreadyArmed);
        }
        self.fail(ArmFailure::Unsupported {
            mode: InterceptionMode::PageGuard,
            reason: "guard pages need an in-process exception handler, unavailable over ptrace"
                .to_string(),
        })
    }

    fn start_hardware_breakpoint(
        &mut self,
        spec: &WatchSpec,
        handler: Arc<dyn TrapHandler>,
    ) -> Result<(), ArmFailure> {
        self.reap();
        if self.worker.is_some() {
            return self.fail(ArmFailure::AlreadyArmed);
        }

        let memory = Memory::new(self.pid);
        match memory.is_mapped(spec.base_address() as usize) {
            Ok(true) => {}
            Ok(false) => return self.fail(ArmFailure::InvalidAddress(spec.base_address())),
            Err(e) => return self.fail(ArmFailure::Other(e.to_string())),
        }

        let reservation = match self.slots.reserve(HardwareWatch::slots_needed(spec)) {
            Ok(reservation) => reservation,
            Err(failure) => return self.fail(failure),
        };
        let watch = match HardwareWatch::new(spec, reservation.indices()) {
            Ok(watch) => watch,
            Err(e) => return self.fail(ArmFailure::Other(e.to_string())),
        };

        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        self.hits.store(0, Ordering::SeqCst);

        let context = WorkerContext {
            pid: self.pid,
            watch,
            _reservation: reservation,
            memory,
            handler,
            hits: Arc::clone(&self.hits),
            armed: Arc::clone(&self.armed),
            control: control_rx,
        };

        let handle = match std::thread::Builder::new()
            .name("kanshi-ptrace".to_string())
            .spawn(move || context.run(ready_tx))
        {
            Ok(handle) => handle,
            Err(e) => return self.fail(ArmFailure::Other(e.to_string())),
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(pid = self.pid, %spec, "Hardware watch armed");
                self.worker = Some(Worker {
                    control: control_tx,
                    handle,
                });
                self.mode = Some(InterceptionMode::HardwareBreakpoint);
                self.last_failure = None;
                Ok(())
            }
            Ok(Err(failure)) => {
                let _ = handle.join();
                self.fail(failure)
            }
            Err(_) => {
                let _ = handle.join();
                self.fail(ArmFailure::Other(
                    "monitor thread exited before arming".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.control.send(Control::Stop);
            if worker.handle.join().is_err() {
                warn!(pid = self.pid, "Monitor thread panicked");
            }
            debug!(pid = self.pid, "Monitor stopped");
        }
        self.armed.store(false, Ordering::SeqCst);
        self.mode = None;
    }

    fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }

    fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    fn active_mode(&self) -> Option<InterceptionMode> {
        self.mode.filter(|_| self.is_armed())
    }

    fn last_failure_reason(&self) -> Option<String> {
        self.last_failure.clone()
    }
}

impl Drop for PtraceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 監視スレッド側の状態
///
/// スロット予約はスレッド終了とともに解放されます。
struct WorkerContext {
    pid: i32,
    watch: HardwareWatch,
    _reservation: SlotReservation,
    memory: Memory,
    handler: Arc<dyn TrapHandler>,
    hits: Arc<AtomicU64>,
    armed: Arc<AtomicBool>,
    control: Receiver<Control>,
}

impl WorkerContext {
    fn run(self, ready: Sender<Result<(), ArmFailure>>) {
        let mut process = match Process::seize(self.pid) {
            Ok(process) => process,
            Err(e) => {
                let _ = ready.send(Err(seize_failure(self.pid, e)));
                return;
            }
        };

        let mut armed_threads = HashSet::new();
        for tid in process.threads() {
            let reason = match process.interrupt(tid) {
                Ok(reason) => reason,
                // 列挙後に終了したスレッド
                Err(_) => {
                    process.forget_thread(tid);
                    continue;
                }
            };
            if let Err(e) = self.arm_thread(tid) {
                process.detach_all(|tid| self.disarm_thread(tid));
                let _ = ready.send(Err(ArmFailure::Other(e.to_string())));
                return;
            }
            armed_threads.insert(tid);
            self.resume(&process, tid, forwarded_signal(&reason));
        }

        self.armed.store(true, Ordering::SeqCst);
        let _ = ready.send(Ok(()));

        let exit = self.event_loop(&mut process, &mut armed_threads);
        self.armed.store(false, Ordering::SeqCst);
        process.detach_all(|tid| self.disarm_thread(tid));

        if let LoopExit::TargetLost(reason) = exit {
            warn!(pid = self.pid, %reason, "Target lost");
            self.handler.on_session_ended(reason);
        }
    }

    fn event_loop(&self, process: &mut Process, armed_threads: &mut HashSet<ThreadId>) -> LoopExit {
        loop {
            match self.control.try_recv() {
                Ok(Control::Stop) | Err(TryRecvError::Disconnected) => return LoopExit::Stopped,
                Err(TryRecvError::Empty) => {}
            }

            match process.wait_any() {
                Ok(Some((tid, reason))) => {
                    if let Some(exit) = self.handle_stop(process, armed_threads, tid, reason) {
                        return exit;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    if e.downcast_ref::<Errno>() == Some(&Errno::ECHILD) {
                        return LoopExit::TargetLost(EndReason::Detached(
                            "no traced threads remain".to_string(),
                        ));
                    }
                    warn!(pid = self.pid, error = %e, "waitpid failed");
                }
            }

            match self.control.recv_timeout(POLL_INTERVAL) {
                Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => return LoopExit::Stopped,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    fn handle_stop(
        &self,
        process: &mut Process,
        armed_threads: &mut HashSet<ThreadId>,
        tid: ThreadId,
        reason: StopReason,
    ) -> Option<LoopExit> {
        match reason {
            StopReason::Trap => {
                let registers = Registers::new(tid);
                let triggered = registers
                    .take_debug_status()
                    .map(|dr6| self.watch.triggered(dr6))
                    .unwrap_or_default();
                if triggered.is_empty() {
                    self.resume(process, tid, Some(Signal::SIGTRAP));
                    return None;
                }
                match registers.read() {
                    Ok(regs) => {
                        let address = rewind::faulting_instruction(&self.memory, &regs, &triggered);
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        self.handler.on_trap(address, tid);
                    }
                    Err(e) => debug!(tid, error = %e, "Failed to read registers after trap"),
                }
                self.resume(process, tid, None);
            }
            StopReason::EventStop => {
                // 新しいスレッドは初回停止で監視を仕掛ける
                process.track_thread(tid);
                if armed_threads.insert(tid) {
                    if let Err(e) = self.arm_thread(tid) {
                        warn!(tid, error = %e, "Failed to arm new thread");
                    }
                }
                self.resume(process, tid, None);
            }
            StopReason::NewThread(child) => {
                debug!(tid, child, "Thread created");
                process.track_thread(child);
                self.resume(process, tid, None);
            }
            StopReason::Signal(signal) => self.resume(process, tid, Some(signal)),
            StopReason::Exited(code) => {
                process.forget_thread(tid);
                armed_threads.remove(&tid);
                if tid == self.pid || !process.has_threads() {
                    return Some(LoopExit::TargetLost(EndReason::TargetExited(code)));
                }
            }
            StopReason::Killed(signal) => {
                process.forget_thread(tid);
                armed_threads.remove(&tid);
                if tid == self.pid || !process.has_threads() {
                    return Some(LoopExit::TargetLost(EndReason::TargetKilled(format!(
                        "{:?}",
                        signal
                    ))));
                }
            }
            StopReason::Other => self.resume(process, tid, None),
        }
        None
    }

    fn arm_thread(&self, tid: ThreadId) -> crate::Result<()> {
        self.watch.install(&Registers::new(tid))
    }

    fn disarm_thread(&self, tid: ThreadId) {
        if let Err(e) = self.watch.remove(&Registers::new(tid)) {
            debug!(tid, error = %e, "Failed to clear debug registers");
        }
    }

    fn resume(&self, process: &Process, tid: ThreadId, signal: Option<Signal>) {
        if let Err(e) = process.resume(tid, signal) {
            debug!(tid, error = %e, "Failed to resume thread");
        }
    }
}

/// 割り込み停止で受け取ったシグナルのうち、再注入すべきもの
fn forwarded_signal(reason: &StopReason) -> Option<Signal> {
    match reason {
        StopReason::Signal(signal) => Some(*signal),
        _ => None,
    }
}

fn seize_failure(pid: i32, error: anyhow::Error) -> ArmFailure {
    match error.downcast_ref::<Errno>() {
        Some(Errno::EPERM) => ArmFailure::InsufficientPrivilege(format!(
            "ptrace seize of {} denied (check ptrace_scope or CAP_SYS_PTRACE)",
            pid
        )),
        Some(Errno::ESRCH) => ArmFailure::Other(format!("process {} not found", pid)),
        _ => ArmFailure::Other(error.to_string()),
    }
}
