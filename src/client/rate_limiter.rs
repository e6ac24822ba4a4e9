//! Fixed-window quota limiter for provider dispatch.
//!
//! Epistemic foundation:
//! - K_i: Each provider has a per-minute and a per-day request ceiling
//! - K_i: A window resets when `now` crosses its boundary
//! - B_i: The wall clock moves forward (might not: a backward jump resets)
//! - I^R: Ceilings are configurable per provider; absent = unlimited

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Length of a quota window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Minute,
    Day,
}

impl WindowKind {
    pub fn length(&self) -> TimeDelta {
        match self {
            WindowKind::Minute => TimeDelta::seconds(60),
            WindowKind::Day => TimeDelta::hours(24),
        }
    }
}

/// Request count bounded by a limit over one fixed window.
///
/// K_i: `count < limit` is the admission predicate; `count` only grows
/// after an admission succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitWindow {
    pub kind: WindowKind,
    /// Ceiling for the window (None = unlimited)
    pub limit: Option<u32>,
    /// Requests charged in the current window
    pub count: u32,
    /// When the current window opened
    pub window_start: DateTime<Utc>,
}

impl RateLimitWindow {
    pub fn new(kind: WindowKind, limit: Option<u32>, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            limit,
            count: 0,
            window_start: now,
        }
    }

    /// Whether `now` lies outside the current window (past its end, or
    /// before its start after a clock step backward).
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now < self.window_start || now - self.window_start >= self.kind.length()
    }

    /// Reset the window if it has expired. Returns true when it reset.
    pub fn roll(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_expired(now) {
            self.count = 0;
            self.window_start = now;
            true
        } else {
            false
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.limit.is_none_or(|limit| self.count < limit)
    }

    /// Count as it would read at `now`, without mutating.
    pub fn count_at(&self, now: DateTime<Utc>) -> u32 {
        if self.is_expired(now) { 0 } else { self.count }
    }

    /// Remaining capacity at `now` (None = unlimited).
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<u32> {
        self.limit
            .map(|limit| limit.saturating_sub(self.count_at(now)))
    }

    /// When the current window closes.
    pub fn resets_at(&self) -> DateTime<Utc> {
        self.window_start + self.kind.length()
    }

    /// Roll, then charge one request if there is capacity.
    pub fn try_charge(&mut self, now: DateTime<Utc>) -> bool {
        self.roll(now);
        if self.has_capacity() {
            self.increment();
            true
        } else {
            false
        }
    }

    fn increment(&mut self) {
        self.count = self.count.saturating_add(1);
    }
}

/// Configured ceilings for one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaLimits {
    pub per_minute: Option<u32>,
    pub per_day: Option<u32>,
}

/// Window state for a single provider.
#[derive(Debug, Clone)]
pub struct ProviderWindows {
    pub minute: RateLimitWindow,
    pub day: RateLimitWindow,
    /// Time of the last charged attempt
    pub last_request: Option<DateTime<Utc>>,
}

impl ProviderWindows {
    fn new(limits: QuotaLimits, now: DateTime<Utc>) -> Self {
        Self {
            minute: RateLimitWindow::new(WindowKind::Minute, limits.per_minute, now),
            day: RateLimitWindow::new(WindowKind::Day, limits.per_day, now),
            last_request: None,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let minute_reset = self.minute.roll(now);
        let day_reset = self.day.roll(now);
        if minute_reset || day_reset {
            debug!(
                minute_reset = minute_reset,
                day_reset = day_reset,
                "Quota window reset"
            );
        }
    }

    fn has_capacity(&self) -> bool {
        self.minute.has_capacity() && self.day.has_capacity()
    }

    fn charge(&mut self, now: DateTime<Utc>) {
        self.minute.increment();
        self.day.increment();
        self.last_request = Some(now);
    }
}

/// Read-only view of one provider's quota usage at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub minute_count: u32,
    pub day_count: u32,
    pub last_request: Option<DateTime<Utc>>,
    /// Whether one more attempt would currently be admitted
    pub admissible: bool,
}

/// Fixed-window quota limiter.
///
/// Tracks per-provider minute/day windows. Windows are created lazily on
/// first reference. Each provider's windows sit behind a `DashMap` shard
/// lock, so check-and-charge is atomic per provider.
#[derive(Debug, Default)]
pub struct RateLimiter {
    /// Configured ceilings per provider
    limits: HashMap<String, QuotaLimits>,
    /// Per-provider window state
    states: DashMap<String, ProviderWindows>,
    /// Global stats
    total_charged: AtomicU64,
    total_rejected: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter with the given per-provider ceilings.
    ///
    /// Providers without an entry are unlimited.
    pub fn new(limits: HashMap<String, QuotaLimits>) -> Self {
        Self {
            limits,
            states: DashMap::new(),
            total_charged: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    fn limits_for(&self, provider: &str) -> QuotaLimits {
        self.limits.get(provider).copied().unwrap_or_default()
    }

    /// Check whether `provider` may take one more attempt.
    ///
    /// Resets any expired window first; does not charge.
    pub fn admit(&self, provider: &str, now: DateTime<Utc>) -> bool {
        let limits = self.limits_for(provider);
        let mut state = self
            .states
            .entry(provider.to_string())
            .or_insert_with(|| ProviderWindows::new(limits, now));
        state.roll(now);

        let admitted = state.has_capacity();
        if !admitted {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            debug!(
                provider = provider,
                minute = state.minute.count,
                day = state.day.count,
                "Quota exhausted"
            );
        }
        admitted
    }

    /// Charge one attempt against both windows, unconditionally.
    pub fn record(&self, provider: &str, now: DateTime<Utc>) {
        let limits = self.limits_for(provider);
        let mut state = self
            .states
            .entry(provider.to_string())
            .or_insert_with(|| ProviderWindows::new(limits, now));
        state.roll(now);
        state.charge(now);
        self.total_charged.fetch_add(1, Ordering::Relaxed);
    }

    /// Admit and charge in one critical section.
    ///
    /// Concurrent callers can never push a window past its limit.
    pub fn try_acquire(&self, provider: &str, now: DateTime<Utc>) -> bool {
        let limits = self.limits_for(provider);
        let mut state = self
            .states
            .entry(provider.to_string())
            .or_insert_with(|| ProviderWindows::new(limits, now));
        state.roll(now);

        if state.has_capacity() {
            state.charge(now);
            self.total_charged.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Current window state for a provider (None if never referenced).
    pub fn window(&self, provider: &str, kind: WindowKind) -> Option<RateLimitWindow> {
        self.states.get(provider).map(|state| match kind {
            WindowKind::Minute => state.minute.clone(),
            WindowKind::Day => state.day.clone(),
        })
    }

    /// Usage as it reads at `now`. Pure: never resets or creates state.
    pub fn usage_at(&self, provider: &str, now: DateTime<Utc>) -> QuotaUsage {
        match self.states.get(provider) {
            Some(state) => {
                let minute_count = state.minute.count_at(now);
                let day_count = state.day.count_at(now);
                let limits = self.limits_for(provider);
                QuotaUsage {
                    minute_count,
                    day_count,
                    last_request: state.last_request,
                    admissible: limits.per_minute.is_none_or(|l| minute_count < l)
                        && limits.per_day.is_none_or(|l| day_count < l),
                }
            }
            None => {
                let limits = self.limits_for(provider);
                QuotaUsage {
                    minute_count: 0,
                    day_count: 0,
                    last_request: None,
                    admissible: limits.per_minute != Some(0) && limits.per_day != Some(0),
                }
            }
        }
    }

    /// Get statistics.
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            total_charged: self.total_charged.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            providers_tracked: self.states.len(),
        }
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub total_charged: u64,
    pub total_rejected: u64,
    pub providers_tracked: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn limiter(per_minute: Option<u32>, per_day: Option<u32>) -> RateLimiter {
        let mut limits = HashMap::new();
        limits.insert(
            "groq".to_string(),
            QuotaLimits {
                per_minute,
                per_day,
            },
        );
        RateLimiter::new(limits)
    }

    #[test]
    fn test_window_try_charge() {
        let mut window = RateLimitWindow::new(WindowKind::Minute, Some(2), t0());
        assert!(window.try_charge(t0()));
        assert!(window.try_charge(t0() + TimeDelta::seconds(10)));
        assert!(!window.try_charge(t0() + TimeDelta::seconds(20)));
        assert_eq!(window.remaining_at(t0() + TimeDelta::seconds(20)), Some(0));
        assert_eq!(window.resets_at(), t0() + TimeDelta::seconds(60));

        assert!(window.try_charge(t0() + TimeDelta::seconds(60)));
        assert_eq!(window.count, 1);
    }

    #[test]
    fn test_minute_window_exhausts_and_rolls_over() {
        let limiter = limiter(Some(3), None);
        let now = t0();

        for i in 0..3 {
            assert!(limiter.admit("groq", now + TimeDelta::seconds(i)));
            limiter.record("groq", now + TimeDelta::seconds(i));
        }
        assert!(!limiter.admit("groq", now + TimeDelta::seconds(10)));
        assert!(!limiter.admit("groq", now + TimeDelta::seconds(59)));

        // Window opened at t0, so it closes at t0 + 60s.
        assert!(limiter.admit("groq", now + TimeDelta::seconds(60)));
        assert_eq!(
            limiter.window("groq", WindowKind::Minute).unwrap().count,
            0
        );
    }

    #[test]
    fn test_day_window_exhausts_and_rolls_over() {
        let limiter = limiter(None, Some(1));
        let now = t0();

        assert!(limiter.try_acquire("groq", now));
        assert!(!limiter.admit("groq", now + TimeDelta::hours(23)));
        assert!(limiter.admit("groq", now + TimeDelta::hours(24)));
    }

    #[test]
    fn test_zero_limit_is_permanently_inadmissible() {
        let limiter = limiter(Some(0), None);
        assert!(!limiter.admit("groq", t0()));
        assert!(!limiter.try_acquire("groq", t0() + TimeDelta::days(3)));
        assert!(!limiter.usage_at("groq", t0()).admissible);
    }

    #[test]
    fn test_unknown_provider_is_unlimited() {
        let limiter = RateLimiter::default();
        for _ in 0..1000 {
            assert!(limiter.try_acquire("local", t0()));
        }
        assert_eq!(limiter.usage_at("local", t0()).minute_count, 1000);
    }

    #[test]
    fn test_backward_clock_resets_window() {
        let limiter = limiter(Some(1), Some(1));
        let now = t0();
        assert!(limiter.try_acquire("groq", now));
        assert!(!limiter.admit("groq", now + TimeDelta::seconds(5)));

        let earlier = now - TimeDelta::minutes(10);
        assert!(limiter.admit("groq", earlier));
        let day = limiter.window("groq", WindowKind::Day).unwrap();
        assert_eq!(day.count, 0);
        assert_eq!(day.window_start, earlier);
    }

    #[test]
    fn test_record_charges_both_windows() {
        let limiter = limiter(Some(10), Some(10));
        limiter.record("groq", t0());
        limiter.record("groq", t0());

        let usage = limiter.usage_at("groq", t0());
        assert_eq!(usage.minute_count, 2);
        assert_eq!(usage.day_count, 2);
        assert_eq!(usage.last_request, Some(t0()));
        assert!(usage.admissible);
    }

    #[test]
    fn test_usage_at_is_pure() {
        let limiter = limiter(Some(1), None);
        assert!(limiter.try_acquire("groq", t0()));

        let later = t0() + TimeDelta::minutes(2);
        let first = limiter.usage_at("groq", later);
        let second = limiter.usage_at("groq", later);
        assert_eq!(first, second);
        assert_eq!(first.minute_count, 0);
        assert!(first.admissible);

        // Stored window untouched by the read.
        assert_eq!(limiter.window("groq", WindowKind::Minute).unwrap().count, 1);
        assert!(limiter.usage_at("never-seen", later).admissible);
        assert_eq!(limiter.stats().providers_tracked, 1);
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_limit() {
        let limiter = Arc::new(limiter(None, Some(50)));
        let now = t0();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..20).filter(|_| limiter.try_acquire("groq", now)).count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
        assert_eq!(limiter.usage_at("groq", now).day_count, 50);
        assert_eq!(limiter.stats().total_rejected, 110);
    }
}
