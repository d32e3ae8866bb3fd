//! 監視エンジンのエラー型

use kanshi_target::ArmFailure;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// テキスト出力の失敗
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to write report to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No session to export")]
    NoSession,

    #[error("Malformed report at line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// エンジン操作の失敗
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to arm watch: {0}")]
    Arm(#[from] ArmFailure),

    #[error("A session is already active; stop it first")]
    SessionActive,

    #[error("Not monitoring")]
    NotMonitoring,

    #[error("Not monitoring with page guards")]
    NotPageGuard,

    #[error(transparent)]
    Export(#[from] ExportError),
}
