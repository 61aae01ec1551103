use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{PreaggError, PreaggResult};

/// TTL specification as accepted from configuration: either a flat number of
/// seconds, or a map of cutoff expressions to seconds. Cutoff keys are the
/// literal `"default"`, a relative expression (`"7d"`, `"24h"`), or an ISO
/// date, resolved against a timezone.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TtlSpec {
    Seconds(i64),
    Schedule(BTreeMap<String, i64>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtlRule {
    pub cutoff: DateTime<Utc>,
    pub ttl_seconds: u64,
}

/// Ordered TTL rules plus a default. Windows starting at or after a rule's
/// cutoff take that rule's TTL; the most recent matching cutoff wins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TtlSchedule {
    rules: Vec<TtlRule>,
    default_ttl_seconds: u64,
}

impl TtlSchedule {
    pub fn uniform(ttl_seconds: i64) -> PreaggResult<Self> {
        Ok(Self {
            rules: Vec::new(),
            default_ttl_seconds: positive_seconds(ttl_seconds, "default")?,
        })
    }

    /// Validates and resolves a `TtlSpec`. Relative and date cutoffs are
    /// anchored to `now` in `tz`; all failures are configuration errors
    /// raised before any job is touched.
    pub fn parse(spec: &TtlSpec, tz: Tz, now: DateTime<Utc>) -> PreaggResult<Self> {
        match spec {
            TtlSpec::Seconds(seconds) => Self::uniform(*seconds),
            TtlSpec::Schedule(entries) => {
                let mut rules = Vec::new();
                let mut default_ttl_seconds = None;
                for (key, seconds) in entries {
                    let seconds = positive_seconds(*seconds, key)?;
                    if key == "default" {
                        default_ttl_seconds = Some(seconds);
                        continue;
                    }
                    let cutoff = resolve_cutoff(key, tz, now)?;
                    rules.push(TtlRule {
                        cutoff,
                        ttl_seconds: seconds,
                    });
                }
                let default_ttl_seconds = default_ttl_seconds.ok_or_else(|| {
                    PreaggError::configuration("ttl schedule is missing a \"default\" entry")
                })?;
                rules.sort_by(|a, b| b.cutoff.cmp(&a.cutoff));
                Ok(Self {
                    rules,
                    default_ttl_seconds,
                })
            }
        }
    }

    /// TTL for a window beginning at `window_start`: first rule (scanning
    /// cutoffs descending) whose cutoff is at or before the window start.
    pub fn ttl_for(&self, window_start: DateTime<Utc>) -> u64 {
        self.rules
            .iter()
            .find(|rule| rule.cutoff <= window_start)
            .map(|rule| rule.ttl_seconds)
            .unwrap_or(self.default_ttl_seconds)
    }

    pub fn default_ttl_seconds(&self) -> u64 {
        self.default_ttl_seconds
    }

    pub fn rules(&self) -> &[TtlRule] {
        &self.rules
    }
}

fn positive_seconds(seconds: i64, key: &str) -> PreaggResult<u64> {
    if seconds <= 0 {
        return Err(PreaggError::configuration(format!(
            "ttl for '{key}' must be a positive number of seconds, got {seconds}"
        )));
    }
    Ok(seconds as u64)
}

fn resolve_cutoff(key: &str, tz: Tz, now: DateTime<Utc>) -> PreaggResult<DateTime<Utc>> {
    if let Some(days) = key.strip_suffix('d').and_then(|n| n.parse::<i64>().ok()) {
        let today = now.with_timezone(&tz).date_naive();
        let date = today - Duration::days(days);
        return local_midnight(date, tz);
    }
    if let Some(hours) = key.strip_suffix('h').and_then(|n| n.parse::<i64>().ok()) {
        return Ok(now - Duration::hours(hours));
    }
    if let Ok(date) = NaiveDate::parse_from_str(key, "%Y-%m-%d") {
        return local_midnight(date, tz);
    }
    Err(PreaggError::configuration(format!(
        "unrecognized ttl schedule key '{key}'"
    )))
}

fn local_midnight(date: NaiveDate, tz: Tz) -> PreaggResult<DateTime<Utc>> {
    let naive = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| {
            PreaggError::configuration(format!(
                "no valid local midnight for {}-{:02}-{:02} in {tz}",
                date.year(),
                date.month(),
                date.day()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::{TtlSchedule, TtlSpec};
    use chrono::{Duration, TimeZone, Utc};
    use chrono_tz::Tz;

    const UTC: Tz = chrono_tz::UTC;

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, 15, 30, 0).unwrap()
    }

    #[test]
    fn flat_seconds_yields_empty_rules() {
        let schedule = TtlSchedule::parse(&TtlSpec::Seconds(86_400), UTC, now()).unwrap();
        assert!(schedule.rules().is_empty());
        assert_eq!(schedule.default_ttl_seconds(), 86_400);
        assert_eq!(schedule.ttl_for(now()), 86_400);
    }

    #[test]
    fn zero_or_negative_seconds_are_rejected() {
        assert!(TtlSchedule::parse(&TtlSpec::Seconds(0), UTC, now()).is_err());
        assert!(TtlSchedule::parse(&TtlSpec::Seconds(-5), UTC, now()).is_err());
        let spec = TtlSpec::Schedule([("default".to_string(), 0)].into_iter().collect());
        assert!(TtlSchedule::parse(&spec, UTC, now()).is_err());
    }

    #[test]
    fn today_cutoff_splits_recent_from_default() {
        let spec = TtlSpec::Schedule(
            [("0d".to_string(), 900), ("default".to_string(), 604_800)]
                .into_iter()
                .collect(),
        );
        let schedule = TtlSchedule::parse(&spec, UTC, now()).unwrap();
        let today_midnight = Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap();
        assert_eq!(schedule.ttl_for(today_midnight), 900);
        assert_eq!(schedule.ttl_for(today_midnight - Duration::days(1)), 604_800);
    }

    #[test]
    fn hour_and_iso_date_cutoffs_resolve() {
        let spec = TtlSpec::Schedule(
            [
                ("24h".to_string(), 3_600),
                ("2025-06-01".to_string(), 7_200),
                ("default".to_string(), 604_800),
            ]
            .into_iter()
            .collect(),
        );
        let schedule = TtlSchedule::parse(&spec, UTC, now()).unwrap();
        // Later cutoffs shadow earlier ones.
        assert_eq!(schedule.ttl_for(now()), 3_600);
        assert_eq!(
            schedule.ttl_for(Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap()),
            7_200
        );
        assert_eq!(
            schedule.ttl_for(Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap()),
            604_800
        );
    }

    #[test]
    fn unrecognized_key_and_missing_default_are_errors() {
        let spec = TtlSpec::Schedule(
            [
                ("soon".to_string(), 60),
                ("default".to_string(), 604_800),
            ]
            .into_iter()
            .collect(),
        );
        assert!(TtlSchedule::parse(&spec, UTC, now()).is_err());

        let spec = TtlSpec::Schedule([("0d".to_string(), 900)].into_iter().collect());
        assert!(TtlSchedule::parse(&spec, UTC, now()).is_err());
    }

    #[test]
    fn timezone_shifts_day_cutoffs() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let spec = TtlSpec::Schedule(
            [("0d".to_string(), 900), ("default".to_string(), 604_800)]
                .into_iter()
                .collect(),
        );
        let schedule = TtlSchedule::parse(&spec, tz, now()).unwrap();
        // Local midnight in New York is 04:00 UTC during DST.
        let cutoff = schedule.rules()[0].cutoff;
        assert_eq!(cutoff, Utc.with_ymd_and_hms(2025, 6, 10, 4, 0, 0).unwrap());
    }
}
