//! 監視対象の定義と監視方式

use std::fmt;
use thiserror::Error;

/// 1つの監視で扱える最大バイト数
pub const MAX_WATCH_SIZE: usize = 16;

/// 割り込み（トラップ）の発生方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterceptionMode {
    /// ページ単位のガードフォルト（粒度は粗いが個数制限なし）
    PageGuard,
    /// デバッグレジスタによるハードウェアブレークポイント（バイト精度、最大4個）
    HardwareBreakpoint,
}

impl fmt::Display for InterceptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptionMode::PageGuard => write!(f, "page guard"),
            InterceptionMode::HardwareBreakpoint => write!(f, "hardware breakpoint"),
        }
    }
}

/// 監視の設定失敗理由
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArmFailure {
    #[error("Insufficient privilege to trace process: {0}")]
    InsufficientPrivilege(String),

    #[error("Invalid or unreadable watch address 0x{0:x}")]
    InvalidAddress(u64),

    #[error("Invalid watch size {0} (expected 1-16 bytes)")]
    InvalidSize(usize),

    #[error("Hardware breakpoint slots exhausted: {needed} needed, {available} available")]
    HardwareSlotsExhausted { needed: usize, available: usize },

    #[error("{mode} interception is not supported: {reason}")]
    Unsupported {
        mode: InterceptionMode,
        reason: String,
    },

    #[error("A trap source is already armed")]
    AlreadyArmed,

    #[error("Failed to arm watch: {0}")]
    Other(String),
}

/// 監視セッションの対象（セッション中は不変）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSpec {
    base_address: u64,
    size: usize,
    write_only: bool,
}

impl WatchSpec {
    /// 監視対象を作成する
    ///
    /// サイズは1〜16バイト。アドレス範囲がu64を越える場合はエラー。
    pub fn new(base_address: u64, size: usize, write_only: bool) -> Result<Self, ArmFailure> {
        if size == 0 || size > MAX_WATCH_SIZE {
            return Err(ArmFailure::InvalidSize(size));
        }
        if base_address.checked_add(size as u64).is_none() {
            return Err(ArmFailure::InvalidAddress(base_address));
        }
        Ok(Self {
            base_address,
            size,
            write_only,
        })
    }

    /// 監視開始アドレス
    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    /// 監視サイズ（バイト）
    pub fn size(&self) -> usize {
        self.size
    }

    /// 書き込みのみを対象とするか
    pub fn write_only(&self) -> bool {
        self.write_only
    }

    /// 監視範囲の終端（排他的）
    pub fn end_address(&self) -> u64 {
        self.base_address + self.size as u64
    }

    /// [start, start+len) が監視範囲と重なるか
    pub fn overlaps(&self, start: u64, len: u64) -> bool {
        let end = start.saturating_add(len.max(1));
        start < self.end_address() && self.base_address < end
    }
}

impl fmt::Display for WatchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:x} ({} byte{}, {})",
            self.base_address,
            self.size,
            if self.size == 1 { "" } else { "s" },
            if self.write_only { "writes" } else { "accesses" }
        )
    }
}
