//! Priority scheduler
//!
//! Pure tier classification and rescan cadence. High-tier wallets are due
//! every pass, medium once per `medium_interval`, low once per
//! `low_interval`; wallets below the low threshold are never due.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::registry::{DepositWallet, SweepThresholds, Tier};

use super::context::Cadence;

/// Tier for a balance under the given thresholds
pub fn classify(balance: Decimal, thresholds: &SweepThresholds) -> Tier {
    if balance >= thresholds.high {
        Tier::High
    } else if balance >= thresholds.medium {
        Tier::Medium
    } else if balance >= thresholds.low && balance > Decimal::ZERO {
        Tier::Low
    } else {
        Tier::None
    }
}

/// Scheduling verdict for one wallet on one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleDecision {
    pub tier: Tier,
    pub due: bool,
}

#[derive(Debug, Clone)]
pub struct PriorityScheduler {
    cadence: Cadence,
}

impl PriorityScheduler {
    pub fn new(cadence: Cadence) -> Self {
        Self { cadence }
    }

    /// Whether a wallet of `tier` last scanned at `last_scanned` is due now
    pub fn is_due(&self, tier: Tier, last_scanned: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let interval = match tier {
            Tier::High => return true,
            Tier::None => return false,
            Tier::Medium => self.cadence.medium_interval,
            Tier::Low => self.cadence.low_interval,
        };

        match last_scanned {
            None => true,
            Some(at) => match (now - at).to_std() {
                Ok(elapsed) => elapsed >= interval,
                // Clock went backwards; rescan rather than stall
                Err(_) => true,
            },
        }
    }

    /// Classify a freshly read balance and decide whether to act on it
    ///
    /// `force` bypasses cadence gating (manual and emergency triggers).
    pub fn evaluate(
        &self,
        wallet: &DepositWallet,
        balance: Decimal,
        thresholds: &SweepThresholds,
        now: DateTime<Utc>,
        force: bool,
    ) -> ScheduleDecision {
        let tier = classify(balance, thresholds);
        let due = force || self.is_due(tier, wallet.last_scanned_at, now);
        ScheduleDecision { tier, due }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn wallet(last_scanned_at: Option<DateTime<Utc>>) -> DepositWallet {
        DepositWallet {
            address: "0x1111111111111111111111111111111111111111".into(),
            user_id: "alice".into(),
            key_handle: "k1".into(),
            last_scanned_at,
            tier: Tier::None,
            last_balance: Decimal::ZERO,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_classify_boundaries() {
        let t = SweepThresholds::default();
        assert_eq!(classify(dec!(150), &t), Tier::High);
        assert_eq!(classify(dec!(100), &t), Tier::High);
        assert_eq!(classify(dec!(99.99), &t), Tier::Medium);
        assert_eq!(classify(dec!(20), &t), Tier::Medium);
        assert_eq!(classify(dec!(5), &t), Tier::Low);
        assert_eq!(classify(dec!(4.99), &t), Tier::None);
        assert_eq!(classify(Decimal::ZERO, &t), Tier::None);
    }

    #[test]
    fn test_classify_monotonic_in_balance() {
        let t = SweepThresholds::default();
        let mut last = Tier::None;
        for cents in (0..20_000).step_by(37) {
            let tier = classify(Decimal::new(cents, 2), &t);
            assert!(tier >= last);
            last = tier;
        }
    }

    #[test]
    fn test_cadence() {
        let scheduler = PriorityScheduler::new(Cadence::default());
        let now = Utc::now();
        let ten_min_ago = Some(now - Duration::minutes(10));
        let two_hours_ago = Some(now - Duration::hours(2));

        assert!(scheduler.is_due(Tier::High, ten_min_ago, now));
        assert!(!scheduler.is_due(Tier::Medium, ten_min_ago, now));
        assert!(scheduler.is_due(Tier::Medium, two_hours_ago, now));
        assert!(!scheduler.is_due(Tier::Low, two_hours_ago, now));
        assert!(scheduler.is_due(Tier::Low, Some(now - Duration::days(2)), now));
        assert!(scheduler.is_due(Tier::Low, None, now));
        assert!(!scheduler.is_due(Tier::None, None, now));
    }

    #[test]
    fn test_force_bypasses_cadence() {
        let scheduler = PriorityScheduler::new(Cadence::default());
        let now = Utc::now();
        let w = wallet(Some(now - Duration::minutes(1)));
        let t = SweepThresholds::default();

        let gated = scheduler.evaluate(&w, dec!(30), &t, now, false);
        assert_eq!(gated, ScheduleDecision { tier: Tier::Medium, due: false });

        let forced = scheduler.evaluate(&w, dec!(30), &t, now, true);
        assert!(forced.due);
    }
}
