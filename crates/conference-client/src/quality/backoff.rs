//! Multi-stage exponential backoff over quality levels.
//!
//! [`QualityBackoff`] is a pure state machine: callers pass the current
//! [`Instant`] and drive the single armed timer themselves (see
//! [`super::controller`] for the actor that does so).
//!
//! A downgrade drops the limit one stage below the stage it was at, and that
//! stage's exponent decides how long to stay down (`base * 2^exponent`). When
//! the period ends the limit goes back up and a verification window of
//! `base + period` starts; surviving it clears the exponent and moves on to
//! the next stage up. Loss during verification escalates the same stage.

use crate::timing::deadline_after;
use common::types::QualitySetting;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Exponents never exceed this, whatever the configured intervals.
const EXPONENT_CEILING: u32 = 31;

/// Tuning for one backoff controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Lowest limit the controller will ever impose.
    pub min_quality: QualitySetting,
    /// Backoff period at exponent 0.
    pub base_interval: Duration,
    /// Upper bound for `base_interval * 2^exponent`.
    pub max_interval: Duration,
    /// Debounce window for downgrades; `None` means `base_interval / 2`.
    pub lock_interval: Option<Duration>,
}

impl BackoffConfig {
    /// Publisher-side tuning (shared by every publisher in the registry).
    #[must_use]
    pub fn publisher() -> Self {
        Self {
            min_quality: QualitySetting::Low,
            base_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(120),
            lock_interval: None,
        }
    }

    /// Subscriber-side tuning, before per-connection randomization.
    #[must_use]
    pub fn subscriber() -> Self {
        Self {
            min_quality: QualitySetting::Low,
            base_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(60),
            lock_interval: None,
        }
    }

    #[must_use]
    pub fn lock_interval(&self) -> Duration {
        self.lock_interval.unwrap_or(self.base_interval / 2)
    }

    /// Copy with `base_interval` drawn uniformly from `[base, 2 * base)`.
    ///
    /// Spreads control loops of many subscribers so they do not back off and
    /// recover in lockstep.
    #[must_use]
    pub fn randomized(&self) -> Self {
        use rand::Rng;

        let base_ms = u64::try_from(self.base_interval.as_millis()).unwrap_or(u64::MAX);
        let jitter_ms = if base_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..base_ms)
        };
        Self {
            base_interval: self.base_interval.saturating_add(Duration::from_millis(jitter_ms)),
            ..self.clone()
        }
    }
}

/// What an armed timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Backoff period over: raise the limit back to `stage`.
    BackoffEnd,
    /// Verification window over: forget `stage`'s exponent and keep recovering.
    CheckEnd,
}

/// The one timer the state machine may have armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimer {
    pub kind: TimerKind,
    pub stage: QualitySetting,
    pub period: Duration,
    pub deadline: Instant,
}

/// Result of [`QualityBackoff::downgrade`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DowngradeOutcome {
    /// Within the lock interval of the previous downgrade.
    Debounced,
    /// Limit already at `min_quality`.
    AtMinimum,
    /// Limit lowered; it stays there for `period`.
    Downgraded {
        limit: QualitySetting,
        period: Duration,
    },
}

/// Backoff state machine for one quality limit.
#[derive(Debug)]
pub struct QualityBackoff {
    min_quality: QualitySetting,
    base_interval: Duration,
    max_interval: Duration,
    lock_interval: Duration,
    max_exponent: u32,
    limit: QualitySetting,
    exponents: BTreeMap<QualitySetting, u32>,
    last_downgrade: Option<Instant>,
    timer: Option<ArmedTimer>,
}

impl QualityBackoff {
    #[must_use]
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            min_quality: config.min_quality,
            base_interval: config.base_interval,
            max_interval: config.max_interval,
            lock_interval: config.lock_interval(),
            max_exponent: max_exponent(config.base_interval, config.max_interval),
            limit: QualitySetting::High,
            exponents: BTreeMap::new(),
            last_downgrade: None,
            timer: None,
        }
    }

    /// Current quality limit, always within `[min_quality, High]`.
    #[must_use]
    pub fn limit(&self) -> QualitySetting {
        self.limit
    }

    /// Backoff exponent of `stage`, if it is currently backed off.
    #[must_use]
    pub fn exponent(&self, stage: QualitySetting) -> Option<u32> {
        self.exponents.get(&stage).copied()
    }

    #[must_use]
    pub fn armed(&self) -> Option<&ArmedTimer> {
        self.timer.as_ref()
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.map(|t| t.deadline)
    }

    #[must_use]
    pub fn max_exponent(&self) -> u32 {
        self.max_exponent
    }

    /// Signal observed degradation.
    pub fn downgrade(&mut self, now: Instant) -> DowngradeOutcome {
        if let Some(last) = self.last_downgrade {
            if now.saturating_duration_since(last) < self.lock_interval {
                debug!(
                    target: "cc.quality",
                    limit = %self.limit,
                    "Downgrade within lock interval ignored"
                );
                return DowngradeOutcome::Debounced;
            }
        }
        self.last_downgrade = Some(now);

        if self.limit <= self.min_quality {
            info!(
                target: "cc.quality",
                limit = %self.limit,
                "Already at minimum quality, not downgrading"
            );
            return DowngradeOutcome::AtMinimum;
        }

        let stage = self.limit;
        let exponent = match self.exponents.get(&stage) {
            Some(previous) => previous.saturating_add(1).min(self.max_exponent),
            None => 0,
        };
        self.exponents.insert(stage, exponent);

        let period = self.period_for(exponent);
        self.limit = stage.lower();
        self.timer = Some(ArmedTimer {
            kind: TimerKind::BackoffEnd,
            stage,
            period,
            deadline: deadline_after(now, period),
        });

        debug!(
            target: "cc.quality",
            from = %stage,
            limit = %self.limit,
            exponent,
            period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            "Quality limit lowered"
        );

        DowngradeOutcome::Downgraded {
            limit: self.limit,
            period,
        }
    }

    /// Fire the armed timer if its deadline has passed.
    ///
    /// Returns `true` when the limit changed.
    pub fn fire(&mut self, now: Instant) -> bool {
        let Some(timer) = self.timer else {
            return false;
        };
        if timer.deadline > now {
            return false;
        }
        self.timer = None;

        match timer.kind {
            TimerKind::BackoffEnd => {
                self.on_backoff_end(now, timer);
                true
            }
            TimerKind::CheckEnd => self.on_check_end(now, timer),
        }
    }

    fn on_backoff_end(&mut self, now: Instant, timer: ArmedTimer) {
        self.limit = self.limit.raise().min(timer.stage.max(self.min_quality));
        self.arm_check(now, self.limit, timer.period);
        debug!(
            target: "cc.quality",
            limit = %self.limit,
            "Backoff period over, verifying"
        );
    }

    fn on_check_end(&mut self, now: Instant, timer: ArmedTimer) -> bool {
        self.exponents.remove(&timer.stage);

        if self.limit >= QualitySetting::High {
            debug!(target: "cc.quality", "Recovered to full quality");
            return false;
        }

        self.limit = self.limit.raise();
        let period = self
            .exponents
            .get(&self.limit)
            .map_or(Duration::ZERO, |e| self.period_for(*e));
        self.arm_check(now, self.limit, period);
        debug!(
            target: "cc.quality",
            limit = %self.limit,
            "Verification passed, raising limit"
        );
        true
    }

    fn arm_check(&mut self, now: Instant, stage: QualitySetting, period: Duration) {
        let window = self.base_interval.saturating_add(period);
        self.timer = Some(ArmedTimer {
            kind: TimerKind::CheckEnd,
            stage,
            period,
            deadline: deadline_after(now, window),
        });
    }

    fn period_for(&self, exponent: u32) -> Duration {
        backoff_period(self.base_interval, exponent)
            .unwrap_or(self.max_interval)
            .min(self.max_interval.max(self.base_interval))
    }
}

/// `base * 2^exponent`, or `None` on overflow.
fn backoff_period(base: Duration, exponent: u32) -> Option<Duration> {
    2u32.checked_pow(exponent)
        .and_then(|factor| base.checked_mul(factor))
}

/// Largest exponent with `base * 2^exponent <= max`.
fn max_exponent(base: Duration, max: Duration) -> u32 {
    let mut exponent = 0;
    while exponent < EXPONENT_CEILING {
        match backoff_period(base, exponent + 1) {
            Some(next) if next <= max => exponent += 1,
            _ => break,
        }
    }
    exponent
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn config(min: QualitySetting, base_ms: u64, max_ms: u64) -> BackoffConfig {
        BackoffConfig {
            min_quality: min,
            base_interval: Duration::from_millis(base_ms),
            max_interval: Duration::from_millis(max_ms),
            lock_interval: None,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_lock_interval_defaults_to_half_base() {
        let cfg = config(QualitySetting::Low, 1000, 8000);
        assert_eq!(cfg.lock_interval(), ms(500));

        let explicit = BackoffConfig {
            lock_interval: Some(ms(100)),
            ..cfg
        };
        assert_eq!(explicit.lock_interval(), ms(100));
    }

    #[test]
    fn test_two_downgrades_within_lock_decrease_once() {
        let mut backoff = QualityBackoff::new(&config(QualitySetting::Off, 1000, 8000));
        let t0 = Instant::now();

        assert!(matches!(
            backoff.downgrade(t0),
            DowngradeOutcome::Downgraded { .. }
        ));
        assert_eq!(backoff.downgrade(t0 + ms(499)), DowngradeOutcome::Debounced);
        assert_eq!(backoff.limit(), QualitySetting::Medium);
    }

    #[test]
    fn test_never_below_min_quality() {
        let mut backoff = QualityBackoff::new(&config(QualitySetting::Low, 1000, 8000));
        let t0 = Instant::now();

        backoff.downgrade(t0);
        assert_eq!(backoff.limit(), QualitySetting::Medium);
        backoff.downgrade(t0 + ms(600));
        assert_eq!(backoff.limit(), QualitySetting::Low);
        assert_eq!(
            backoff.downgrade(t0 + ms(1200)),
            DowngradeOutcome::AtMinimum
        );
        assert_eq!(backoff.limit(), QualitySetting::Low);
    }

    #[test]
    fn test_first_downgrade_uses_base_interval() {
        let mut backoff = QualityBackoff::new(&config(QualitySetting::Off, 1000, 8000));
        let t0 = Instant::now();

        let outcome = backoff.downgrade(t0);
        assert_eq!(
            outcome,
            DowngradeOutcome::Downgraded {
                limit: QualitySetting::Medium,
                period: ms(1000)
            }
        );
        assert_eq!(backoff.exponent(QualitySetting::High), Some(0));
        let armed = backoff.armed().unwrap();
        assert_eq!(armed.kind, TimerKind::BackoffEnd);
        assert_eq!(armed.stage, QualitySetting::High);
        assert_eq!(armed.deadline, t0 + ms(1000));
    }

    #[test]
    fn test_timer_does_not_fire_early() {
        let mut backoff = QualityBackoff::new(&config(QualitySetting::Off, 1000, 8000));
        let t0 = Instant::now();
        backoff.downgrade(t0);

        assert!(!backoff.fire(t0 + ms(999)));
        assert_eq!(backoff.limit(), QualitySetting::Medium);
    }

    #[test]
    fn test_full_recovery_clears_exponents() {
        let mut backoff = QualityBackoff::new(&config(QualitySetting::Off, 1000, 8000));
        let t0 = Instant::now();

        backoff.downgrade(t0);
        backoff.downgrade(t0 + ms(600));
        assert_eq!(backoff.limit(), QualitySetting::Low);
        assert_eq!(backoff.exponent(QualitySetting::High), Some(0));
        assert_eq!(backoff.exponent(QualitySetting::Medium), Some(0));

        // Medium backoff ends at 1600ms: back to Medium, verify for 1000 + 1000.
        let t1 = t0 + ms(1600);
        assert!(backoff.fire(t1));
        assert_eq!(backoff.limit(), QualitySetting::Medium);
        let armed = *backoff.armed().unwrap();
        assert_eq!(armed.kind, TimerKind::CheckEnd);
        assert_eq!(armed.deadline, t1 + ms(2000));

        // Verification passes: Medium forgotten, raise to High and verify it.
        let t2 = armed.deadline;
        assert!(backoff.fire(t2));
        assert_eq!(backoff.limit(), QualitySetting::High);
        assert_eq!(backoff.exponent(QualitySetting::Medium), None);
        let armed = *backoff.armed().unwrap();
        assert_eq!(armed.stage, QualitySetting::High);

        // Final verification at High clears the last exponent.
        assert!(!backoff.fire(armed.deadline));
        assert_eq!(backoff.limit(), QualitySetting::High);
        assert_eq!(backoff.exponent(QualitySetting::High), None);
        assert!(backoff.armed().is_none());
    }

    #[test]
    fn test_loss_during_verification_escalates_same_stage() {
        let mut backoff = QualityBackoff::new(&config(QualitySetting::Off, 1000, 8000));
        let t0 = Instant::now();

        backoff.downgrade(t0);
        backoff.fire(t0 + ms(1000));
        assert_eq!(backoff.limit(), QualitySetting::High);

        let outcome = backoff.downgrade(t0 + ms(1500));
        assert_eq!(
            outcome,
            DowngradeOutcome::Downgraded {
                limit: QualitySetting::Medium,
                period: ms(2000)
            }
        );
        assert_eq!(backoff.exponent(QualitySetting::High), Some(1));
        // The downgrade replaced the verification timer.
        assert_eq!(backoff.armed().unwrap().kind, TimerKind::BackoffEnd);
    }

    #[test]
    fn test_exponent_capped_by_max_interval() {
        let mut backoff = QualityBackoff::new(&config(QualitySetting::Medium, 1000, 4000));
        assert_eq!(backoff.max_exponent(), 2);
        let mut now = Instant::now();

        let mut periods = Vec::new();
        for _ in 0..4 {
            if let DowngradeOutcome::Downgraded { period, .. } = backoff.downgrade(now) {
                periods.push(period);
                now += period;
                backoff.fire(now);
                now += ms(10);
            }
        }
        assert_eq!(periods, vec![ms(1000), ms(2000), ms(4000), ms(4000)]);
    }

    #[test]
    fn test_max_exponent_handles_huge_ratios() {
        assert_eq!(max_exponent(ms(1), Duration::from_secs(u64::MAX)), 31);
        assert_eq!(max_exponent(ms(0), ms(0)), 31);
        assert_eq!(max_exponent(ms(5000), ms(1000)), 0);
    }

    #[test]
    fn test_backoff_period_overflow_is_none() {
        assert_eq!(backoff_period(Duration::MAX, 1), None);
        assert_eq!(backoff_period(ms(3), 2), Some(ms(12)));
    }

    #[test]
    fn test_min_high_never_downgrades() {
        let mut backoff = QualityBackoff::new(&config(QualitySetting::High, 1000, 8000));
        assert_eq!(
            backoff.downgrade(Instant::now()),
            DowngradeOutcome::AtMinimum
        );
        assert_eq!(backoff.limit(), QualitySetting::High);
    }

    #[test]
    fn test_randomized_base_within_range() {
        let cfg = config(QualitySetting::Low, 2000, 60_000);
        for _ in 0..50 {
            let randomized = cfg.randomized();
            assert!(randomized.base_interval >= ms(2000));
            assert!(randomized.base_interval < ms(4000));
            assert_eq!(randomized.min_quality, QualitySetting::Low);
        }
    }

    #[test]
    fn test_huge_intervals_do_not_overflow() {
        let cfg = BackoffConfig {
            min_quality: QualitySetting::Off,
            base_interval: Duration::MAX,
            max_interval: Duration::MAX,
            lock_interval: None,
        };
        let randomized = cfg.randomized();
        assert_eq!(randomized.base_interval, Duration::MAX);

        let mut backoff = QualityBackoff::new(&cfg);
        let t0 = Instant::now();
        assert!(matches!(
            backoff.downgrade(t0),
            DowngradeOutcome::Downgraded { .. }
        ));
        let armed = backoff.armed().unwrap();
        assert!(armed.deadline > t0 + Duration::from_secs(3600));
        assert!(!backoff.fire(t0 + ms(1000)));
    }
}
