//! ページガード方式の沈黙を検出するウォッチドッグ

use kanshi_target::InterceptionMode;
use std::time::Duration;

/// ウォッチドッグの判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    Continue,
    /// ハードウェア方式への切り替えを提案する
    OfferEscalation { silent_for: Duration },
}

/// フォールバック方針
///
/// 周期ごとに `observe` を呼びます。ページガード方式で監視中に
/// 猶予期間を過ぎてもヒットが0件なら、1回だけ切り替えを提案します。
/// 提案が断られた場合は、さらに猶予期間を丸ごと待ちます。
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    grace: Duration,
    cadence: Duration,
    silent_for: Duration,
    last_total: u64,
    offered: bool,
}

impl FallbackPolicy {
    pub fn new(grace: Duration, cadence: Duration) -> Self {
        Self {
            grace,
            cadence,
            silent_for: Duration::ZERO,
            last_total: 0,
            offered: false,
        }
    }

    /// 提案への応答待ちか
    pub fn offer_pending(&self) -> bool {
        self.offered
    }

    /// 1周期分の観測
    pub fn observe(
        &mut self,
        total_hits: u64,
        mode: Option<InterceptionMode>,
        armed: bool,
    ) -> WatchdogVerdict {
        if !armed || mode != Some(InterceptionMode::PageGuard) {
            self.silent_for = Duration::ZERO;
            self.last_total = total_hits;
            return WatchdogVerdict::Continue;
        }

        if total_hits != self.last_total || total_hits > 0 {
            self.last_total = total_hits;
            self.silent_for = Duration::ZERO;
            return WatchdogVerdict::Continue;
        }

        self.silent_for += self.cadence;
        if !self.offered && self.silent_for >= self.grace {
            self.offered = true;
            return WatchdogVerdict::OfferEscalation {
                silent_for: self.silent_for,
            };
        }
        WatchdogVerdict::Continue
    }

    /// 提案が断られた。猶予期間を最初から数え直す
    pub fn decline(&mut self) {
        self.offered = false;
        self.silent_for = Duration::ZERO;
    }

    /// 新しいセッションのために初期化する
    pub fn reset(&mut self) {
        self.offered = false;
        self.silent_for = Duration::ZERO;
        self.last_total = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PG: Option<InterceptionMode> = Some(InterceptionMode::PageGuard);

    fn policy() -> FallbackPolicy {
        FallbackPolicy::new(Duration::from_secs(15), Duration::from_secs(1))
    }

    fn ticks_until_offer(policy: &mut FallbackPolicy, limit: usize) -> Option<usize> {
        (1..=limit).find(|_| policy.observe(0, PG, true) != WatchdogVerdict::Continue)
    }

    #[test]
    fn test_offer_after_grace_period() {
        let mut policy = policy();
        for _ in 0..14 {
            assert_eq!(policy.observe(0, PG, true), WatchdogVerdict::Continue);
        }
        assert_eq!(
            policy.observe(0, PG, true),
            WatchdogVerdict::OfferEscalation {
                silent_for: Duration::from_secs(15)
            }
        );
        assert!(policy.offer_pending());
        // 応答があるまで再提案しない
        assert_eq!(ticks_until_offer(&mut policy, 60), None);
    }

    #[test]
    fn test_decline_waits_full_grace_period() {
        let mut policy = policy();
        assert_eq!(ticks_until_offer(&mut policy, 60), Some(15));
        policy.decline();
        assert!(!policy.offer_pending());
        assert_eq!(ticks_until_offer(&mut policy, 60), Some(15));
    }

    #[test]
    fn test_hits_suppress_offer() {
        let mut policy = policy();
        for total in 0..10 {
            policy.observe(total, PG, true);
        }
        for _ in 0..30 {
            assert_eq!(policy.observe(9, PG, true), WatchdogVerdict::Continue);
        }
    }

    #[test]
    fn test_only_page_guard_is_watched() {
        let mut policy = policy();
        for _ in 0..30 {
            assert_eq!(
                policy.observe(0, Some(InterceptionMode::HardwareBreakpoint), true),
                WatchdogVerdict::Continue
            );
            assert_eq!(policy.observe(0, PG, false), WatchdogVerdict::Continue);
        }
    }

    #[test]
    fn test_reset() {
        let mut policy = policy();
        ticks_until_offer(&mut policy, 60);
        policy.reset();
        assert!(!policy.offer_pending());
        assert_eq!(ticks_until_offer(&mut policy, 60), Some(15));
    }
}
