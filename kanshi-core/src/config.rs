//! エンジン設定

use crate::disasm::MAX_INSTRUCTION_LEN;
use kanshi_target::InterceptionMode;
use std::time::Duration;

/// 監視エンジンの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// 表示更新の周期
    pub refresh_interval: Duration,
    /// ウォッチドッグの周期
    pub watchdog_interval: Duration,
    /// ページガード方式で沈黙を許す期間
    pub escalation_grace: Duration,
    /// 最初に試す監視方式
    pub initial_mode: InterceptionMode,
    /// トラップした命令のために読むバイト数
    pub decode_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_millis(250),
            watchdog_interval: Duration::from_secs(1),
            escalation_grace: Duration::from_secs(15),
            initial_mode: InterceptionMode::PageGuard,
            decode_window: MAX_INSTRUCTION_LEN,
        }
    }
}
