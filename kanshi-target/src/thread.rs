//! スレッド列挙機能

use crate::Result;

/// スレッドID
pub type ThreadId = i32;

/// /proc/pid/task を読み取り、プロセス内の全スレッドIDを取得する
pub fn list_threads(pid: i32) -> Result<Vec<ThreadId>> {
    let task_dir = format!("/proc/{}/task", pid);
    let entries = std::fs::read_dir(&task_dir)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", task_dir, e))?;

    let mut tids: Vec<ThreadId> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();
    tids.sort_unstable();

    Ok(tids)
}
