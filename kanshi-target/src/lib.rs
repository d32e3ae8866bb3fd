//! Kanshi ターゲットプロセス制御
//!
//! このクレートは、監視対象プロセスにアクセスするための低レベル機能を提供します。
//! ptrace、メモリ読み取り、デバッグレジスタ、ハードウェアウォッチポイント、
//! そしてトラップを発生させる監視ソース（TrapSource）を扱います。

pub mod process;
pub mod thread;
pub mod memory;
pub mod registers;
pub mod breakpoint;
pub mod slots;
pub mod watch;
pub mod monitor;
pub mod ptrace_monitor;
pub mod rewind;

pub use process::{Process, StopReason};
pub use thread::{list_threads, ThreadId};
pub use memory::{Memory, MemoryMapping, ModuleInfo, ProcessMemory};
pub use registers::Registers;
pub use breakpoint::{HardwareBreakpoint, HardwareWatch};
pub use slots::{SlotPool, SlotReservation, HARDWARE_SLOT_COUNT};
pub use watch::{ArmFailure, InterceptionMode, WatchSpec, MAX_WATCH_SIZE};
pub use monitor::{EndReason, TrapHandler, TrapSource};
pub use ptrace_monitor::PtraceMonitor;

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
