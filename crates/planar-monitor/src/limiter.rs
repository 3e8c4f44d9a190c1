//! Per-(rule, job) alert rate limiting and manual mutes.
//!
//! Each `(rule, job)` pair counts dispatches inside a fixed window of
//! `max_alerts_period`. Once the count reaches `max_alerts_per_monitor`,
//! dispatches are suppressed until the window rolls over. Mutes short-circuit
//! every check until they expire. Stale windows and expired mutes are only
//! removed by [`MonitorLimiter::evict_stale`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

/// Limiter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterConfig {
    pub max_alerts_per_monitor: u32,
    pub max_alerts_period: Duration,
    /// Longest mute that may be set.
    pub manual_mute_max_period: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_alerts_per_monitor: 10,
            max_alerts_period: Duration::from_secs(3600),
            manual_mute_max_period: Duration::from_secs(24 * 3600),
        }
    }
}

/// What the limiter decided for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed,
    Muted { until: DateTime<Utc> },
    RateLimited { until: DateTime<Utc> },
}

impl LimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, LimitDecision::Allowed)
    }
}

/// What a mute applies to. `None` means any.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MuteScope {
    pub job_id: Option<String>,
    pub rule_id: Option<i64>,
}

impl MuteScope {
    fn covers(&self, rule_id: i64, job_id: &str) -> bool {
        self.job_id.as_deref().is_none_or(|j| j == job_id)
            && self.rule_id.is_none_or(|r| r == rule_id)
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: DateTime<Utc>,
    count: u32,
}

/// Process-local alert limiter.
#[derive(Debug)]
pub struct MonitorLimiter {
    config: LimiterConfig,
    windows: DashMap<(i64, String), Window>,
    mutes: DashMap<MuteScope, DateTime<Utc>>,
}

fn chrono_span(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

impl MonitorLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            mutes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Decide whether `(rule, job)` may dispatch at `now`, counting it if so.
    pub fn check(&self, rule_id: i64, job_id: &str, now: DateTime<Utc>) -> LimitDecision {
        if let Some(until) = self.muted_until(rule_id, job_id, now) {
            debug!(rule_id, job_id, until = %until, "dispatch muted");
            return LimitDecision::Muted { until };
        }

        let period = chrono_span(self.config.max_alerts_period);
        let mut window = self
            .windows
            .entry((rule_id, job_id.to_string()))
            .or_insert(Window {
                started: now,
                count: 0,
            });

        if now - window.started >= period {
            *window = Window {
                started: now,
                count: 0,
            };
        }

        if window.count >= self.config.max_alerts_per_monitor {
            let until = window.started + period;
            debug!(rule_id, job_id, until = %until, "dispatch rate limited");
            return LimitDecision::RateLimited { until };
        }

        window.count += 1;
        LimitDecision::Allowed
    }

    /// Mute dispatches for a job, a rule, or one rule on one job.
    ///
    /// The period is capped at `manual_mute_max_period`. Returns the expiry,
    /// or `None` if neither a job nor a rule was given.
    pub fn mute(
        &self,
        job_id: Option<&str>,
        rule_id: Option<i64>,
        period: Duration,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if job_id.is_none() && rule_id.is_none() {
            return None;
        }
        let capped = period.min(self.config.manual_mute_max_period);
        let until = now + chrono_span(capped);
        self.mutes.insert(
            MuteScope {
                job_id: job_id.map(str::to_string),
                rule_id,
            },
            until,
        );
        info!(?job_id, ?rule_id, until = %until, "mute set");
        Some(until)
    }

    /// Remove a mute. Returns false if there was none.
    pub fn unmute(&self, job_id: Option<&str>, rule_id: Option<i64>) -> bool {
        self.mutes
            .remove(&MuteScope {
                job_id: job_id.map(str::to_string),
                rule_id,
            })
            .is_some()
    }

    fn muted_until(&self, rule_id: i64, job_id: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.mutes
            .iter()
            .filter(|m| *m.value() > now && m.key().covers(rule_id, job_id))
            .map(|m| *m.value())
            .max()
    }

    /// Drop rolled-over windows and expired mutes. Returns how many were removed.
    pub fn evict_stale(&self, now: DateTime<Utc>) -> usize {
        let period = chrono_span(self.config.max_alerts_period);
        let before = self.windows.len() + self.mutes.len();
        self.windows.retain(|_, w| now - w.started < period);
        self.mutes.retain(|_, until| *until > now);
        let removed = before - (self.windows.len() + self.mutes.len());
        if removed > 0 {
            debug!(removed, "evicted stale limiter state");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    use super::*;

    fn limiter(max: u32) -> MonitorLimiter {
        MonitorLimiter::new(LimiterConfig {
            max_alerts_per_monitor: max,
            max_alerts_period: Duration::from_secs(3600),
            manual_mute_max_period: Duration::from_secs(7200),
        })
    }

    #[test]
    fn test_window_allows_max_then_rolls_over() {
        let limiter = limiter(2);
        let now = Utc::now();

        assert!(limiter.check(1, "job", now).is_allowed());
        assert!(limiter.check(1, "job", now + ChronoDuration::minutes(10)).is_allowed());
        assert!(matches!(
            limiter.check(1, "job", now + ChronoDuration::minutes(20)),
            LimitDecision::RateLimited { .. }
        ));
        assert!(limiter.check(1, "job", now + ChronoDuration::hours(1)).is_allowed());
    }

    #[test]
    fn test_pairs_are_independent() {
        let limiter = limiter(1);
        let now = Utc::now();
        assert!(limiter.check(1, "a", now).is_allowed());
        assert!(limiter.check(1, "b", now).is_allowed());
        assert!(limiter.check(2, "a", now).is_allowed());
        assert!(!limiter.check(1, "a", now).is_allowed());
    }

    #[test]
    fn test_mute_suppresses_until_expiry_and_is_capped() {
        let limiter = limiter(100);
        let now = Utc::now();

        let until = limiter
            .mute(Some("job"), None, Duration::from_secs(86400), now)
            .unwrap();
        assert_eq!(until, now + ChronoDuration::hours(2));

        assert!(matches!(
            limiter.check(7, "job", now + ChronoDuration::minutes(1)),
            LimitDecision::Muted { .. }
        ));
        assert!(limiter.check(7, "other", now).is_allowed());
        assert!(limiter.check(7, "job", until + ChronoDuration::seconds(1)).is_allowed());
    }

    #[test]
    fn test_rule_mute_and_unmute() {
        let limiter = limiter(100);
        let now = Utc::now();
        assert!(limiter.mute(None, None, Duration::from_secs(60), now).is_none());

        limiter.mute(None, Some(3), Duration::from_secs(60), now);
        assert!(!limiter.check(3, "any", now).is_allowed());
        assert!(limiter.unmute(None, Some(3)));
        assert!(limiter.check(3, "any", now).is_allowed());
    }

    #[test]
    fn test_evict_stale() {
        let limiter = limiter(5);
        let now = Utc::now();
        limiter.check(1, "job", now);
        limiter.mute(Some("job"), None, Duration::from_secs(60), now);

        assert_eq!(limiter.evict_stale(now), 0);
        assert_eq!(limiter.evict_stale(now + ChronoDuration::hours(2)), 2);
    }

    proptest! {
        // Within one window a pair never dispatches more than the maximum.
        #[test]
        fn never_exceeds_max_per_window(max in 1u32..10, events in 1usize..50) {
            let limiter = limiter(max);
            let now = Utc::now();
            let allowed = (0..events)
                .filter(|i| limiter.check(1, "job", now + ChronoDuration::seconds(*i as i64)).is_allowed())
                .count();
            prop_assert_eq!(allowed, events.min(max as usize));
        }
    }
}
