//! プロセス制御機能
//!
//! PTRACE_SEIZE で対象プロセスの全スレッドをトレースします。
//! ptrace の制約により、[`Process`] は生成したスレッドからのみ操作できます。

use crate::thread::{list_threads, ThreadId};
use crate::Result;
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// 停止イベントの種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// SIGTRAP（ウォッチポイントなど）
    Trap,
    /// PTRACE_EVENT_STOP（割り込み停止、新しいスレッドの初回停止、グループ停止）
    EventStop,
    /// スレッドが新しいスレッドを生成した
    NewThread(ThreadId),
    /// シグナル受信
    Signal(Signal),
    /// スレッド終了
    Exited(i32),
    /// シグナルによる終了
    Killed(Signal),
    /// その他の停止
    Other,
}

/// トレース中のプロセス
pub struct Process {
    pid: Pid,
    threads: Vec<Pid>,
}

impl Process {
    /// プロセスの全スレッドをseizeする
    ///
    /// スレッド生成を追跡するため PTRACE_O_TRACECLONE を設定します。
    /// 列挙後に消えたスレッドは無視します。
    pub fn seize(pid: i32) -> Result<Self> {
        let main = Pid::from_raw(pid);
        ptrace::seize(main, Options::PTRACE_O_TRACECLONE)?;

        let mut process = Self {
            pid: main,
            threads: vec![main],
        };

        for tid in list_threads(pid)? {
            if tid == pid {
                continue;
            }
            match ptrace::seize(Pid::from_raw(tid), Options::PTRACE_O_TRACECLONE) {
                Ok(()) => process.threads.push(Pid::from_raw(tid)),
                Err(Errno::ESRCH) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(process)
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// トレース中のスレッド一覧
    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads.iter().map(|tid| tid.as_raw()).collect()
    }

    /// トレース中のスレッドがあるか
    pub fn has_threads(&self) -> bool {
        !self.threads.is_empty()
    }

    /// 新しいスレッドを追跡対象に加える
    pub fn track_thread(&mut self, tid: ThreadId) {
        let tid = Pid::from_raw(tid);
        if !self.threads.contains(&tid) {
            self.threads.push(tid);
        }
    }

    /// 終了したスレッドを追跡対象から外す
    pub fn forget_thread(&mut self, tid: ThreadId) {
        self.threads.retain(|t| t.as_raw() != tid);
    }

    /// スレッドを割り込み停止させ、停止を待つ
    pub fn interrupt(&self, tid: ThreadId) -> Result<StopReason> {
        let pid = Pid::from_raw(tid);
        ptrace::interrupt(pid)?;
        self.wait_for(tid)
    }

    /// 指定スレッドの停止を待つ
    pub fn wait_for(&self, tid: ThreadId) -> Result<StopReason> {
        let status = waitpid(Pid::from_raw(tid), Some(WaitPidFlag::__WALL))?;
        match Self::classify(status)? {
            Some((_, reason)) => Ok(reason),
            None => Ok(StopReason::Other),
        }
    }

    /// いずれかのスレッドの停止イベントを取得する（ブロックしない）
    ///
    /// イベントがなければ `None` を返します。
    pub fn wait_any(&self) -> Result<Option<(ThreadId, StopReason)>> {
        let status = waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL))?;
        Self::classify(status)
    }

    /// スレッドを実行継続する
    pub fn resume(&self, tid: ThreadId, signal: Option<Signal>) -> Result<()> {
        ptrace::cont(Pid::from_raw(tid), signal)?;
        Ok(())
    }

    /// 全スレッドを停止させてからデタッチする
    ///
    /// `before_detach` は停止中の各スレッドに対して呼ばれます（デバッグレジスタの解除など）。
    pub fn detach_all<F: FnMut(ThreadId)>(&mut self, mut before_detach: F) {
        for tid in std::mem::take(&mut self.threads) {
            if ptrace::interrupt(tid).is_ok() && waitpid(tid, Some(WaitPidFlag::__WALL)).is_ok() {
                before_detach(tid.as_raw());
            }
            let _ = ptrace::detach(tid, None);
        }
    }

    fn classify(status: WaitStatus) -> Result<Option<(ThreadId, StopReason)>> {
        let event = match status {
            WaitStatus::StillAlive => return Ok(None),
            WaitStatus::Stopped(pid, Signal::SIGTRAP) => (pid, StopReason::Trap),
            WaitStatus::Stopped(pid, signal) => (pid, StopReason::Signal(signal)),
            WaitStatus::PtraceEvent(pid, _, event) if event == nix::libc::PTRACE_EVENT_CLONE => {
                let child = ptrace::getevent(pid)? as ThreadId;
                (pid, StopReason::NewThread(child))
            }
            WaitStatus::PtraceEvent(pid, _, event) if event == nix::libc::PTRACE_EVENT_STOP => {
                (pid, StopReason::EventStop)
            }
            WaitStatus::Exited(pid, code) => (pid, StopReason::Exited(code)),
            WaitStatus::Signaled(pid, signal, _) => (pid, StopReason::Killed(signal)),
            other => match other.pid() {
                Some(pid) => (pid, StopReason::Other),
                None => return Ok(None),
            },
        };
        Ok(Some((event.0.as_raw(), event.1)))
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.detach_all(|_| {});
    }
}
