//! トラップソース（監視ソース）の抽象化
//!
//! トラップソースは監視対象に割り込みを仕掛け、トラップごとに
//! バックグラウンドスレッドから [`TrapHandler`] を呼び出します。
//! 命令の意味は解釈しません。

use crate::thread::ThreadId;
use crate::watch::{ArmFailure, InterceptionMode, WatchSpec};
use std::fmt;
use std::sync::Arc;

/// セッション終了理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// 対象プロセスが終了した
    TargetExited(i32),
    /// 対象プロセスがシグナルで終了した
    TargetKilled(String),
    /// トレースが外れた（デタッチなど）
    Detached(String),
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::TargetExited(code) => write!(f, "target exited with code {}", code),
            EndReason::TargetKilled(signal) => write!(f, "target killed by {}", signal),
            EndReason::Detached(reason) => write!(f, "target detached: {}", reason),
        }
    }
}

/// トラップ通知の受け手
///
/// トラップソースのバックグラウンドスレッドから呼ばれます。
pub trait TrapHandler: Send + Sync {
    /// トラップ1回分の通知
    fn on_trap(&self, instruction_address: u64, thread_id: ThreadId);

    /// 対象の喪失による終了通知（1回だけ）
    fn on_session_ended(&self, reason: EndReason);
}

/// トラップソース
pub trait TrapSource: Send {
    /// ページガード方式で監視を開始する
    fn start_page_guard(
        &mut self,
        spec: &WatchSpec,
        handler: Arc<dyn TrapHandler>,
    ) -> Result<(), ArmFailure>;

    /// ハードウェアブレークポイント方式で監視を開始する
    fn start_hardware_breakpoint(
        &mut self,
        spec: &WatchSpec,
        handler: Arc<dyn TrapHandler>,
    ) -> Result<(), ArmFailure>;

    /// 監視を解除する
    ///
    /// 戻った時点で以降のトラップは通知されません。
    fn stop(&mut self);

    /// 生のトラップ回数
    fn hit_count(&self) -> u64;

    /// 監視中か
    fn is_armed(&self) -> bool;

    /// 現在の監視方式
    fn active_mode(&self) -> Option<InterceptionMode>;

    /// 直近の設定失敗理由
    fn last_failure_reason(&self) -> Option<String>;
}
