use crate::backup::record::ArchiveRecord;
use bon::Builder;
use chrono::{DateTime, Duration, Utc};
use getset::CopyGetters;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// How long an uploaded archive is kept before it counts as expired.
#[derive(Clone, Copy, Debug, Validate, Serialize, Deserialize, Builder, CopyGetters, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[getset(get_copy = "pub")]
pub struct RetentionConfig {
    #[validate(range(min = 1))]
    expiry_days: u32,
}

impl RetentionConfig {
    pub fn horizon(&self) -> Duration {
        Duration::days(i64::from(self.expiry_days))
    }

    /// The instant an archive taken at `timestamp` expires.
    pub fn expiry_instant(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        timestamp + self.horizon()
    }

    pub fn is_expired(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now >= self.expiry_instant(timestamp)
    }

    /// Expired records, oldest first. Records without a timestamp never expire.
    pub fn expired<'r, I>(&self, records: I, now: DateTime<Utc>) -> Vec<&'r ArchiveRecord>
    where
        I: IntoIterator<Item = &'r ArchiveRecord>,
    {
        records
            .into_iter()
            .filter_map(|r| r.timestamp().map(|ts| (ts, r)))
            .filter(|(ts, _)| self.is_expired(*ts, now))
            .sorted_by_key(|(ts, _)| *ts)
            .map(|(_, r)| r)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::upload::RemoteId;
    use chrono::TimeZone;

    fn config(days: u32) -> RetentionConfig {
        RetentionConfig::builder().expiry_days(days).build()
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_expiry_instant() {
        assert_eq!(config(30).expiry_instant(at(2024, 1, 1)), at(2024, 1, 31));
        assert_eq!(config(1).expiry_instant(at(2024, 2, 28)), at(2024, 2, 29));
    }

    #[test]
    fn test_expiry_instant_is_pure() {
        let retention = config(7);
        let first = retention.expiry_instant(at(2024, 3, 1));
        let second = retention.expiry_instant(at(2024, 3, 1));
        assert_eq!(first, second);
    }

    #[test]
    fn test_is_expired_boundary() {
        let retention = config(30);
        let taken = at(2024, 1, 1);
        assert!(!retention.is_expired(taken, at(2024, 1, 30)));
        assert!(retention.is_expired(taken, at(2024, 1, 31)));
        assert!(retention.is_expired(taken, at(2024, 6, 1)));
    }

    #[test]
    fn test_expired_records_oldest_first() {
        let records = vec![
            ArchiveRecord::new("2024-03-01_00:00 vm1", RemoteId::from("c")),
            ArchiveRecord::new("2024-01-01_00:00 vm1", RemoteId::from("a")),
            ArchiveRecord::new("manual upload", RemoteId::from("x")),
            ArchiveRecord::new("2024-02-01_00:00 vm1", RemoteId::from("b")),
        ];

        let expired = config(30).expired(&records, at(2024, 3, 5));

        let ids: Vec<&str> = expired.iter().map(|r| r.remote_id().as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_zero_days_rejected() {
        let retention: RetentionConfig = serde_yml::from_str("expiry_days: 0").unwrap();
        assert!(retention.validate().is_err());
        let retention: RetentionConfig = serde_yml::from_str("expiry_days: 90").unwrap();
        assert!(retention.validate().is_ok());
    }
}
