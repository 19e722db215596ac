//! Per-client daily request counters with tiered limits.

use crate::clock::SharedClock;
use crate::config::QuotaConfig;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Default,
    Privileged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct UsageRecord {
    day: NaiveDate,
    count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub used: u32,
    pub limit: u32,
    pub tier: Tier,
    /// Seconds until the local day rolls over; meaningful when denied.
    pub retry_after_secs: u64,
}

impl QuotaDecision {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }
}

#[derive(Debug)]
pub struct QuotaLedger {
    records: Mutex<HashMap<String, UsageRecord>>,
    config: QuotaConfig,
    offset: FixedOffset,
    clock: SharedClock,
}

impl QuotaLedger {
    /// `offset` decides where calendar days start.
    pub fn new(config: QuotaConfig, offset: FixedOffset, clock: SharedClock) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            config,
            offset,
            clock,
        }
    }

    pub fn tier_of(&self, client_id: &str) -> Tier {
        if self.config.privileged_clients.iter().any(|c| c == client_id) {
            Tier::Privileged
        } else {
            Tier::Default
        }
    }

    fn limit_for(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Default => self.config.default_limit,
            Tier::Privileged => self.config.privileged_limit,
        }
    }

    fn local_day(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    fn secs_until_midnight(&self, now: DateTime<Utc>) -> u64 {
        let local = now.with_timezone(&self.offset);
        let next_midnight = local
            .date_naive()
            .succ_opt()
            .and_then(|day| day.and_hms_opt(0, 0, 0))
            .and_then(|midnight| midnight.and_local_timezone(self.offset).single());
        match next_midnight {
            Some(midnight) => (midnight - local).num_seconds().max(1) as u64,
            None => Duration::days(1).num_seconds() as u64,
        }
    }

    /// Evaluates `client_id` against today's limit and, when allowed, counts
    /// the request. Records from an earlier day are treated as absent.
    pub fn check(&self, client_id: &str) -> QuotaDecision {
        let now = self.clock.now();
        let today = self.local_day(now);
        let tier = self.tier_of(client_id);
        let limit = self.limit_for(tier);

        let mut records = self.records.lock();
        let record = records
            .entry(client_id.to_string())
            .or_insert_with(|| UsageRecord {
                day: today,
                count: 0,
            });
        if record.day != today {
            debug!("new day for client {}, resetting usage", client_id);
            *record = UsageRecord {
                day: today,
                count: 0,
            };
        }

        if record.count >= limit {
            let retry_after_secs = self.secs_until_midnight(now);
            info!(
                "quota exhausted for client {} ({}/{}), resets in {}s",
                client_id, record.count, limit, retry_after_secs
            );
            return QuotaDecision {
                allowed: false,
                used: record.count,
                limit,
                tier,
                retry_after_secs,
            };
        }

        record.count += 1;
        QuotaDecision {
            allowed: true,
            used: record.count,
            limit,
            tier,
            retry_after_secs: 0,
        }
    }

    /// Today's usage without counting anything.
    pub fn usage(&self, client_id: &str) -> u32 {
        let today = self.local_day(self.clock.now());
        self.records
            .lock()
            .get(client_id)
            .filter(|record| record.day == today)
            .map(|record| record.count)
            .unwrap_or(0)
    }

    /// Drops records left over from earlier days.
    pub fn purge_stale(&self) -> usize {
        let today = self.local_day(self.clock.now());
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| record.day == today);
        before - records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn ledger(start: DateTime<Utc>) -> (Arc<ManualClock>, QuotaLedger) {
        let clock = Arc::new(ManualClock::new(start));
        let config = QuotaConfig {
            default_limit: 3,
            privileged_limit: 5,
            privileged_clients: vec!["vip".to_string()],
        };
        let utc = FixedOffset::east_opt(0).unwrap();
        (clock.clone(), QuotaLedger::new(config, utc, clock))
    }

    #[test]
    fn denies_the_request_after_the_limit_until_the_next_day() {
        let (clock, ledger) = ledger(Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap());

        for expected in 1..=3 {
            let decision = ledger.check("alice");
            assert!(decision.allowed);
            assert_eq!(decision.used, expected);
        }
        let denied = ledger.check("alice");
        assert!(!denied.allowed);
        assert_eq!(denied.used, 3);
        assert_eq!(denied.limit, 3);
        assert_eq!(denied.remaining(), 0);
        assert_eq!(denied.retry_after_secs, 16 * 3600);

        clock.advance(Duration::hours(16));
        let next_day = ledger.check("alice");
        assert!(next_day.allowed);
        assert_eq!(next_day.used, 1);
    }

    #[test]
    fn denial_does_not_consume_quota() {
        let (_clock, ledger) = ledger(Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap());
        for _ in 0..10 {
            ledger.check("bob");
        }
        assert_eq!(ledger.usage("bob"), 3);
    }

    #[test]
    fn privileged_clients_get_the_higher_limit() {
        let (_clock, ledger) = ledger(Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap());
        let allowed = (0..10).filter(|_| ledger.check("vip").allowed).count();
        assert_eq!(allowed, 5);
        assert_eq!(ledger.check("vip").tier, Tier::Privileged);
        assert_eq!(ledger.tier_of("someone"), Tier::Default);
    }

    #[test]
    fn days_follow_the_configured_offset() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 10, 3, 0, 0).unwrap(),
        ));
        let config = QuotaConfig {
            default_limit: 1,
            privileged_limit: 1,
            privileged_clients: Vec::new(),
        };
        // UTC-5: 03:00Z is 22:00 on the previous local day
        let offset = FixedOffset::west_opt(5 * 3600).unwrap();
        let ledger = QuotaLedger::new(config, offset, clock.clone());

        assert!(ledger.check("carol").allowed);
        let denied = ledger.check("carol");
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs, 2 * 3600);

        clock.advance(Duration::hours(2));
        assert!(ledger.check("carol").allowed);
    }

    #[test]
    fn purge_drops_previous_days() {
        let (clock, ledger) = ledger(Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap());
        ledger.check("a");
        ledger.check("b");
        clock.advance(Duration::days(1));
        ledger.check("c");
        assert_eq!(ledger.purge_stale(), 2);
        assert_eq!(ledger.usage("c"), 1);
        assert_eq!(ledger.usage("a"), 0);
    }
}
