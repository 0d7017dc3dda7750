use chrono::{DateTime, TimeDelta, Utc};

use crate::backup::Tier;

/// Configure retention of backups per [Tier].
///
/// Manual backups are never removed, no matter their age.
#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::Args, serde::Deserialize, serde::Serialize)]
pub struct RetentionConfig {
    /// Days to keep daily backups.
    #[arg(id = "retention-daily", long = "retention-daily", env = "BACKUP_RETENTION_DAILY", default_value_t = 7)]
    pub daily: u32,

    /// Weeks to keep weekly backups.
    #[arg(id = "retention-weekly", long = "retention-weekly", env = "BACKUP_RETENTION_WEEKLY", default_value_t = 4)]
    pub weekly: u32,

    /// Months (of 30 days) to keep monthly backups.
    #[arg(id = "retention-monthly", long = "retention-monthly", env = "BACKUP_RETENTION_MONTHLY", default_value_t = 12)]
    pub monthly: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            daily: 7,
            weekly: 4,
            monthly: 12,
        }
    }
}

impl RetentionConfig {
    /// Maximum age in days a backup of the tier may reach.
    ///
    /// [None] means the tier is kept forever.
    pub fn max_age_days(&self, tier: Tier) -> Option<i64> {
        match tier {
            Tier::Daily => Some(i64::from(self.daily)),
            Tier::Weekly => Some(i64::from(self.weekly) * 7),
            Tier::Monthly => Some(i64::from(self.monthly) * 30),
            Tier::Manual => None,
        }
    }
}

/// Age of a backup in whole days.
pub fn age_in_days(created: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - created).num_days()
}

/// Returns if a backup of `tier` created at `created` has outlived its retention.
///
/// The exact age counts, a daily backup kept for 7 days expires 7 days after
/// its creation and not a day later.
pub fn is_expired(cfg: &RetentionConfig, tier: Tier, created: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    cfg.max_age_days(tier)
        .is_some_and(|max_age| now - created > TimeDelta::days(max_age))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn days_ago(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
        now - TimeDelta::days(days)
    }

    #[test]
    fn daily_boundary() {
        let cfg = RetentionConfig::default();
        let now = Utc::now();

        assert!(!is_expired(&cfg, Tier::Daily, days_ago(now, 6), now));
        assert!(!is_expired(&cfg, Tier::Daily, days_ago(now, 7), now));
        assert!(is_expired(&cfg, Tier::Daily, days_ago(now, 8), now));
    }

    #[test]
    fn partial_days_count() {
        let cfg = RetentionConfig::default();
        let now = Utc::now();
        let hours = TimeDelta::hours;

        assert!(is_expired(&cfg, Tier::Daily, days_ago(now, 7) - hours(1), now));
        assert!(is_expired(&cfg, Tier::Daily, days_ago(now, 7) - hours(23), now));
        assert!(!is_expired(&cfg, Tier::Daily, days_ago(now, 7) + hours(1), now));
        assert_eq!(age_in_days(days_ago(now, 7) - hours(23), now), 7);
    }

    #[test]
    fn weekly_and_monthly_scale_by_period() {
        let cfg = RetentionConfig {
            daily: 1,
            weekly: 2,
            monthly: 3,
        };
        let now = Utc::now();

        assert!(!is_expired(&cfg, Tier::Weekly, days_ago(now, 14), now));
        assert!(is_expired(&cfg, Tier::Weekly, days_ago(now, 15), now));
        assert!(!is_expired(&cfg, Tier::Monthly, days_ago(now, 90), now));
        assert!(is_expired(&cfg, Tier::Monthly, days_ago(now, 91), now));
    }

    #[test]
    fn manual_never_expires() {
        let cfg = RetentionConfig::default();
        let now = Utc::now();

        assert!(!is_expired(&cfg, Tier::Manual, days_ago(now, 10_000), now));
    }
}
