//! Admission control: a global per-user cooldown plus daily counters for
//! rate-limited platforms.
//!
//! Counters are incremented when a request is admitted, not when it succeeds,
//! so a failed download still consumes the day's slot.

use super::{Platform, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Reason a request was not admitted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Denial {
    /// The user sent a request less than one cooldown window ago
    #[error("cooldown active, retry in {remaining:?}")]
    Cooldown {
        /// Time left in the window
        remaining: Duration,
    },
    /// The user's daily allowance for a platform is used up
    #[error("daily limit of {limit} reached for {platform}")]
    DailyLimit {
        /// Rate-limited platform
        platform: Platform,
        /// Configured daily maximum
        limit: u32,
    },
}

/// Per-user counters for one UTC day
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredQuotaRecord")]
pub struct QuotaRecord {
    /// UTC day the counters belong to (`YYYY-MM-DD`)
    pub day: String,
    /// Admissions per rate-limited platform
    pub counts: BTreeMap<Platform, u32>,
}

/// On-disk shape; older builds stored a single Instagram `count`
#[derive(Deserialize)]
struct StoredQuotaRecord {
    #[serde(default)]
    day: String,
    #[serde(default)]
    counts: BTreeMap<Platform, u32>,
    #[serde(default)]
    count: Option<u32>,
}

impl From<StoredQuotaRecord> for QuotaRecord {
    fn from(stored: StoredQuotaRecord) -> Self {
        let mut counts = stored.counts;
        if let Some(count) = stored.count {
            counts.entry(Platform::Instagram).or_insert(count);
        }
        Self {
            day: stored.day,
            counts,
        }
    }
}

/// Persisted form: user id (as string) to record
pub type QuotaSnapshot = BTreeMap<String, QuotaRecord>;

/// UTC day stamp used for quota records
#[must_use]
pub fn day_stamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

#[derive(Default)]
struct GateState {
    cooldowns: HashMap<UserId, DateTime<Utc>>,
    records: HashMap<UserId, QuotaRecord>,
}

/// Cooldown and daily-quota gate
pub struct QuotaGate {
    state: Mutex<GateState>,
    cooldown: Duration,
    daily_limit: u32,
    rate_limited: HashSet<Platform>,
}

impl QuotaGate {
    /// Creates a gate with empty counters
    #[must_use]
    pub fn new(cooldown: Duration, daily_limit: u32, rate_limited: HashSet<Platform>) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cooldown,
            daily_limit,
            rate_limited,
        }
    }

    /// Whether a platform is subject to the daily limit
    #[must_use]
    pub fn is_rate_limited(&self, platform: Platform) -> bool {
        self.rate_limited.contains(&platform)
    }

    /// Configured daily limit
    #[must_use]
    pub const fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    /// Configured cooldown window
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Full admission decision for a single request.
    ///
    /// The cooldown is checked first, independent of platform. On admission
    /// the cooldown timestamp is refreshed and, for rate-limited platforms,
    /// the day's counter is incremented.
    ///
    /// # Errors
    ///
    /// Returns the [`Denial`] reason when the request is rejected.
    pub async fn admit(
        &self,
        user_id: UserId,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> Result<(), Denial> {
        let mut state = self.state.lock().await;
        self.check_cooldown_locked(&state, user_id, now)?;
        self.admit_platform_locked(&mut state, user_id, platform, now)?;
        state.cooldowns.insert(user_id, now);
        Ok(())
    }

    /// Cooldown-only check for a message that may carry several links.
    ///
    /// Stamps the cooldown when it passes.
    ///
    /// # Errors
    ///
    /// Returns [`Denial::Cooldown`] inside the window.
    pub async fn touch_cooldown(&self, user_id: UserId, now: DateTime<Utc>) -> Result<(), Denial> {
        let mut state = self.state.lock().await;
        self.check_cooldown_locked(&state, user_id, now)?;
        state.cooldowns.insert(user_id, now);
        Ok(())
    }

    /// Daily-quota-only check for one link of an already cooldown-checked message.
    ///
    /// # Errors
    ///
    /// Returns [`Denial::DailyLimit`] when the allowance is used up.
    pub async fn admit_platform(
        &self,
        user_id: UserId,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> Result<(), Denial> {
        let mut state = self.state.lock().await;
        self.admit_platform_locked(&mut state, user_id, platform, now)
    }

    /// Admissions counted today for a user and platform
    pub async fn count_for(&self, user_id: UserId, platform: Platform, now: DateTime<Utc>) -> u32 {
        let today = day_stamp(now);
        let state = self.state.lock().await;
        state
            .records
            .get(&user_id)
            .filter(|record| record.day == today)
            .and_then(|record| record.counts.get(&platform).copied())
            .unwrap_or(0)
    }

    /// Forgets cooldown stamps older than the window. Returns how many were dropped.
    pub async fn prune_cooldowns(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock().await;
        let before = state.cooldowns.len();
        let window = self.cooldown;
        state
            .cooldowns
            .retain(|_, last| elapsed(*last, now) < window);
        before - state.cooldowns.len()
    }

    /// Serializable copy of the daily counters
    pub async fn snapshot(&self) -> QuotaSnapshot {
        let state = self.state.lock().await;
        state
            .records
            .iter()
            .map(|(user, record)| (user.to_string(), record.clone()))
            .collect()
    }

    /// Replaces the daily counters with a persisted snapshot.
    ///
    /// Entries with non-numeric user ids are skipped.
    pub async fn restore(&self, snapshot: QuotaSnapshot) {
        let records: HashMap<UserId, QuotaRecord> = snapshot
            .into_iter()
            .filter_map(|(user, record)| user.parse::<UserId>().ok().map(|id| (id, record)))
            .collect();
        debug!(users = records.len(), "Restored quota counters");
        self.state.lock().await.records = records;
    }

    fn check_cooldown_locked(
        &self,
        state: &GateState,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<(), Denial> {
        if let Some(last) = state.cooldowns.get(&user_id) {
            let since = elapsed(*last, now);
            if since < self.cooldown {
                return Err(Denial::Cooldown {
                    remaining: self.cooldown - since,
                });
            }
        }
        Ok(())
    }

    fn admit_platform_locked(
        &self,
        state: &mut GateState,
        user_id: UserId,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> Result<(), Denial> {
        let today = day_stamp(now);
        let record = state.records.entry(user_id).or_default();
        if record.day != today {
            record.day = today;
            record.counts.clear();
        }

        if !self.is_rate_limited(platform) {
            return Ok(());
        }

        let count = record.counts.entry(platform).or_insert(0);
        if *count >= self.daily_limit {
            return Err(Denial::DailyLimit {
                platform,
                limit: self.daily_limit,
            });
        }
        *count += 1;
        debug!(user_id, %platform, count = *count, "Quota slot consumed");
        Ok(())
    }
}

/// Non-negative time between two instants; clock skew counts as zero
fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    to.signed_duration_since(from).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn gate(limit: u32) -> QuotaGate {
        QuotaGate::new(
            Duration::from_secs(3),
            limit,
            HashSet::from([Platform::Instagram]),
        )
    }

    fn at(day: u32, secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 10, 0, 0)
            .single()
            .expect("valid date")
            + chrono::Duration::seconds(secs)
    }

    #[tokio::test]
    async fn test_cooldown_denies_inside_window() {
        let gate = gate(10);
        assert!(gate.admit(1, Platform::Twitter, at(1, 0)).await.is_ok());

        let denied = gate.admit(1, Platform::Twitter, at(1, 2)).await;
        assert!(matches!(denied, Err(Denial::Cooldown { .. })));

        assert!(gate.admit(1, Platform::Twitter, at(1, 3)).await.is_ok());
    }

    #[tokio::test]
    async fn test_cooldown_is_per_user() {
        let gate = gate(10);
        assert!(gate.admit(1, Platform::TikTok, at(1, 0)).await.is_ok());
        assert!(gate.admit(2, Platform::TikTok, at(1, 0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_cooldown_checked_before_quota() {
        let gate = gate(0);
        assert!(gate.touch_cooldown(1, at(1, 0)).await.is_ok());
        let denied = gate.admit(1, Platform::Instagram, at(1, 1)).await;
        assert!(matches!(denied, Err(Denial::Cooldown { .. })));
    }

    #[tokio::test]
    async fn test_daily_limit_and_increment() {
        let gate = gate(2);
        for i in 0..2 {
            assert!(gate
                .admit(1, Platform::Instagram, at(1, i * 10))
                .await
                .is_ok());
            assert_eq!(
                gate.count_for(1, Platform::Instagram, at(1, i * 10)).await,
                u32::try_from(i + 1).expect("small")
            );
        }
        let denied = gate.admit(1, Platform::Instagram, at(1, 30)).await;
        assert_eq!(
            denied,
            Err(Denial::DailyLimit {
                platform: Platform::Instagram,
                limit: 2
            })
        );
        // Unlimited platforms are unaffected
        assert!(gate.admit(1, Platform::Twitter, at(1, 40)).await.is_ok());
        assert_eq!(gate.count_for(1, Platform::Twitter, at(1, 40)).await, 0);
    }

    #[tokio::test]
    async fn test_denied_quota_does_not_stamp_cooldown() {
        let gate = gate(0);
        assert!(gate.admit(1, Platform::Instagram, at(1, 0)).await.is_err());
        assert!(gate.admit(1, Platform::Twitter, at(1, 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_new_day_resets_counter() {
        let gate = gate(1);
        assert!(gate.admit(1, Platform::Instagram, at(1, 0)).await.is_ok());
        assert!(gate.admit(1, Platform::Instagram, at(1, 10)).await.is_err());

        assert!(gate.admit(1, Platform::Instagram, at(2, 0)).await.is_ok());
        assert_eq!(gate.count_for(1, Platform::Instagram, at(2, 0)).await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let gate = gate(5);
        gate.admit(42, Platform::Instagram, at(1, 0)).await.ok();
        let snapshot = gate.snapshot().await;
        assert_eq!(snapshot["42"].counts[&Platform::Instagram], 1);

        let restored = QuotaGate::new(
            Duration::from_secs(3),
            5,
            HashSet::from([Platform::Instagram]),
        );
        let mut snapshot = snapshot;
        snapshot.insert("not-a-user".to_string(), QuotaRecord::default());
        restored.restore(snapshot).await;
        assert_eq!(restored.count_for(42, Platform::Instagram, at(1, 5)).await, 1);
    }

    #[test]
    fn test_single_count_record_maps_to_instagram() {
        let record: QuotaRecord =
            serde_json::from_str(r#"{"count":7,"day":"2026-03-01"}"#).expect("parse");
        assert_eq!(record.day, "2026-03-01");
        assert_eq!(record.counts.get(&Platform::Instagram), Some(&7));

        let written = serde_json::to_string(&record).expect("serialize");
        assert!(!written.contains("\"count\""));
        assert!(written.contains("\"counts\""));
    }

    #[tokio::test]
    async fn test_prune_cooldowns() {
        let gate = gate(5);
        gate.touch_cooldown(1, at(1, 0)).await.ok();
        gate.touch_cooldown(2, at(1, 5)).await.ok();
        assert_eq!(gate.prune_cooldowns(at(1, 6)).await, 1);
    }

    proptest! {
        #[test]
        fn admissions_never_closer_than_cooldown(offsets in proptest::collection::vec(0i64..20, 1..30)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime");
            rt.block_on(async {
                let gate = gate(u32::MAX);
                let mut now = 0i64;
                let mut admitted: Vec<i64> = Vec::new();
                for step in offsets {
                    now += step;
                    if gate.admit(9, Platform::Twitter, at(1, now)).await.is_ok() {
                        admitted.push(now);
                    }
                }
                for pair in admitted.windows(2) {
                    assert!(pair[1] - pair[0] >= 3);
                }
            });
        }
    }
}
