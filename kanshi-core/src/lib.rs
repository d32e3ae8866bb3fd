//! Kanshi 監視エンジン
//!
//! このクレートは、他プロセスのメモリアドレスに触れる命令を特定するための
//! 中核ロジックを提供します。トラップした命令のデコードと分類、集約、
//! 監視方式のフォールバック、表示の間引きを統合します。

pub mod aggregator;
pub mod classify;
pub mod command;
pub mod config;
pub mod disasm;
pub mod errors;
pub mod export;
pub mod parse;
pub mod scheduler;
pub mod session;
pub mod throttle;
pub mod watchdog;

pub use aggregator::{AccessEntry, Aggregator, ModuleLocation, TrapOutcome};
pub use classify::{classify, overlaps_watched_range, relevant_for, Classification, FilterPolicy};
pub use command::Command;
pub use config::EngineConfig;
pub use disasm::{decode, DecodeError, Instruction, OpcodeClass, OperandAddress};
pub use errors::{ExportError, WatchError};
pub use export::{parse_report, ReportRow};
pub use scheduler::{ManualScheduler, Scheduler, TaskHandle, ThreadScheduler};
pub use session::{MonitorState, NoopObserver, SessionObserver, SessionStats, WatchEngine};
pub use watchdog::{FallbackPolicy, WatchdogVerdict};

// 他のクレートから使用するために再エクスポート
pub use kanshi_target::{ArmFailure, EndReason, InterceptionMode, WatchSpec};

/// 監視エンジンの結果型
pub type Result<T> = anyhow::Result<T>;
