//! ハードウェアブレークポイントスロットの管理
//!
//! x86のデバッグレジスタ（DR0〜DR3）はプロセス全体で4つしかないため、
//! 明示的な共有リソースとしてロック付きで予約・解放します。

use crate::watch::ArmFailure;
use parking_lot::Mutex;
use std::sync::Arc;

/// デバッグレジスタのスロット数
pub const HARDWARE_SLOT_COUNT: usize = 4;

/// プロセス全体で共有するスロットプール
#[derive(Debug, Clone, Default)]
pub struct SlotPool {
    used: Arc<Mutex<[bool; HARDWARE_SLOT_COUNT]>>,
}

impl SlotPool {
    /// 新しいスロットプールを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// 空きスロット数
    pub fn available(&self) -> usize {
        self.used.lock().iter().filter(|used| !**used).count()
    }

    /// スロットを `count` 個予約する
    ///
    /// 足りない場合は何も予約せずにエラーを返します。
    pub fn reserve(&self, count: usize) -> Result<SlotReservation, ArmFailure> {
        let mut used = self.used.lock();
        let free: Vec<usize> = used
            .iter()
            .enumerate()
            .filter(|(_, in_use)| !**in_use)
            .map(|(index, _)| index)
            .take(count)
            .collect();

        if free.len() < count {
            let available = used.iter().filter(|in_use| !**in_use).count();
            return Err(ArmFailure::HardwareSlotsExhausted {
                needed: count,
                available,
            });
        }

        for &index in &free {
            used[index] = true;
        }

        Ok(SlotReservation {
            pool: self.clone(),
            indices: free,
        })
    }

    fn release(&self, indices: &[usize]) {
        let mut used = self.used.lock();
        for &index in indices {
            used[index] = false;
        }
    }
}

/// 予約済みスロット（Dropで解放される）
#[derive(Debug)]
pub struct SlotReservation {
    pool: SlotPool,
    indices: Vec<usize>,
}

impl SlotReservation {
    /// 予約したデバッグレジスタのインデックス
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.pool.release(&self.indices);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let pool = SlotPool::new();
        let first = pool.reserve(3).unwrap();
        assert_eq!(first.indices(), &[0, 1, 2]);
        assert_eq!(pool.available(), 1);

        let err = pool.reserve(2).unwrap_err();
        assert_eq!(
            err,
            ArmFailure::HardwareSlotsExhausted {
                needed: 2,
                available: 1
            }
        );
        // 失敗した予約は何も消費しない
        assert_eq!(pool.available(), 1);

        drop(first);
        assert_eq!(pool.available(), HARDWARE_SLOT_COUNT);
    }

    #[test]
    fn test_shared_between_clones() {
        let pool = SlotPool::new();
        let other = pool.clone();
        let _held = pool.reserve(4).unwrap();
        assert!(other.reserve(1).is_err());
    }
}
