//! 表示更新の間引き
//!
//! トラップごとに立つダーティフラグを一定周期で確認し、
//! 立っていたときだけ1回描画します。

use crate::aggregator::Aggregator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 描画コールバック
pub type RenderFn = Box<dyn Fn() + Send + Sync>;

pub struct PresentationThrottle {
    aggregator: Arc<Aggregator>,
    render: RenderFn,
    renders: AtomicU64,
}

impl PresentationThrottle {
    pub fn new(aggregator: Arc<Aggregator>, render: RenderFn) -> Self {
        Self {
            aggregator,
            render,
            renders: AtomicU64::new(0),
        }
    }

    /// 周期タスクから呼ばれる。変更があれば描画して `true` を返す
    pub fn tick(&self) -> bool {
        if !self.aggregator.take_dirty() {
            return false;
        }
        self.render_now();
        true
    }

    /// 無条件に描画する（監視終了時）
    pub fn flush(&self) {
        self.aggregator.take_dirty();
        self.render_now();
    }

    pub fn render_count(&self) -> u64 {
        self.renders.load(Ordering::Relaxed)
    }

    fn render_now(&self) {
        self.renders.fetch_add(1, Ordering::Relaxed);
        (self.render)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kanshi_target::{ModuleInfo, ProcessMemory, WatchSpec};

    struct NoMemory;

    impl ProcessMemory for NoMemory {
        fn read_bytes(&self, address: u64, _length: usize) -> kanshi_target::Result<Vec<u8>> {
            Err(anyhow::anyhow!("Failed to read memory at 0x{:x}", address))
        }

        fn owning_module(&self, _address: u64) -> Option<ModuleInfo> {
            None
        }

        fn is_64bit(&self) -> bool {
            true
        }
    }

    fn throttle() -> (Arc<Aggregator>, PresentationThrottle) {
        let spec = WatchSpec::new(0x1000, 4, false).unwrap();
        let aggregator = Arc::new(Aggregator::new(spec, Arc::new(NoMemory), 15));
        let throttle = PresentationThrottle::new(Arc::clone(&aggregator), Box::new(|| {}));
        (aggregator, throttle)
    }

    #[test]
    fn test_tick_renders_only_when_dirty() {
        let (aggregator, throttle) = throttle();
        assert!(!throttle.tick());

        // 読めない命令は残る
        for _ in 0..100 {
            aggregator.on_trap(0x2000, 1);
        }
        assert!(throttle.tick());
        assert!(!throttle.tick());
        assert_eq!(throttle.render_count(), 1);
    }

    #[test]
    fn test_flush_always_renders() {
        let (_aggregator, throttle) = throttle();
        throttle.flush();
        throttle.flush();
        assert_eq!(throttle.render_count(), 2);
    }
}
