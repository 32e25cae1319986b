//! Latest known rate-limit state. A dimension missing from
//! [`STALE_AFTER_MISSES`] successful polls in a row reads as unknown.

use crate::http::{ErrorKind, ProbeError, ProbeReport};
use crate::types::{Dimension, DimensionReading};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const STALE_AFTER_MISSES: u32 = 3;

static EMPTY_SLOT: DimensionSlot = DimensionSlot {
    reading: None,
    misses: 0,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionSlot {
    pub reading: Option<DimensionReading>,
    /// Consecutive successful polls that did not report this dimension.
    pub misses: u32,
}

impl DimensionSlot {
    pub fn is_stale(&self) -> bool {
        self.misses >= STALE_AFTER_MISSES
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitState {
    dimensions: BTreeMap<Dimension, DimensionSlot>,
    fetched_at: Option<DateTime<Utc>>,
    last_error: Option<LastError>,
}

impl Default for LimitState {
    fn default() -> Self {
        let dimensions = Dimension::ALL
            .iter()
            .map(|d| (*d, DimensionSlot::default()))
            .collect();
        Self {
            dimensions,
            fetched_at: None,
            last_error: None,
        }
    }
}

impl LimitState {
    /// Time of the last successful poll.
    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    pub fn slot(&self, dim: Dimension) -> &DimensionSlot {
        self.dimensions.get(&dim).unwrap_or(&EMPTY_SLOT)
    }

    /// Current reading, or `None` if never reported or stale.
    pub fn reading(&self, dim: Dimension) -> Option<&DimensionReading> {
        let slot = self.slot(dim);
        if slot.is_stale() {
            return None;
        }
        slot.reading.as_ref()
    }

    pub fn is_stale(&self, dim: Dimension) -> bool {
        self.slot(dim).is_stale()
    }

    pub fn has_data(&self) -> bool {
        Dimension::ALL.iter().any(|d| self.reading(*d).is_some())
    }

    pub fn apply_success(&mut self, report: &ProbeReport, now: DateTime<Utc>) {
        for (dim, slot) in self.dimensions.iter_mut() {
            match report.get(*dim) {
                Some(reading) => {
                    slot.reading = Some(*reading);
                    slot.misses = 0;
                }
                None => {
                    slot.misses = slot.misses.saturating_add(1);
                    if slot.misses == STALE_AFTER_MISSES {
                        log::warn!("dimension={} stale after {} misses", dim, slot.misses);
                    }
                }
            }
        }
        self.fetched_at = Some(now);
        self.last_error = None;
    }

    /// 429 responses still carry metadata: take the readings, but this is not
    /// a successful poll, so `fetched_at` stays put and unreported dimensions
    /// are not counted as missed.
    pub fn apply_rate_limited(
        &mut self,
        report: &ProbeReport,
        err: &ProbeError,
        now: DateTime<Utc>,
    ) {
        for (dim, reading) in report.iter() {
            if let Some(slot) = self.dimensions.get_mut(&dim) {
                slot.reading = Some(*reading);
                slot.misses = 0;
            }
        }
        self.record_error(err, now);
    }

    pub fn apply_failure(&mut self, err: &ProbeError, now: DateTime<Utc>) {
        if let ProbeError::RateLimited { partial, .. } = err {
            self.apply_rate_limited(partial, err, now);
            return;
        }
        self.record_error(err, now);
    }

    fn record_error(&mut self, err: &ProbeError, now: DateTime<Utc>) {
        self.last_error = Some(LastError {
            kind: err.kind(),
            message: err.to_string(),
            at: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn report(dims: &[(Dimension, i64, i64)]) -> ProbeReport {
        let mut r = ProbeReport::default();
        for (d, limit, remaining) in dims {
            r.insert(*d, DimensionReading::new(*limit, *remaining, None));
        }
        r
    }

    fn full_report() -> ProbeReport {
        report(&[
            (Dimension::InputTokens, 1000, 600),
            (Dimension::OutputTokens, 500, 500),
            (Dimension::Requests, 50, 49),
            (Dimension::TotalTokens, 1500, 1100),
        ])
    }

    #[test]
    fn success_advances_fetched_at_and_clears_error() {
        let mut s = LimitState::default();
        let t0 = Utc::now();
        s.apply_failure(&ProbeError::Network("timeout".into()), t0);
        assert_eq!(s.fetched_at(), None);
        assert_eq!(s.last_error().unwrap().kind, ErrorKind::Network);

        let t1 = t0 + Duration::seconds(60);
        s.apply_success(&full_report(), t1);
        assert_eq!(s.fetched_at(), Some(t1));
        assert!(s.last_error().is_none());
        assert_eq!(s.reading(Dimension::InputTokens).unwrap().remaining(), 600);
    }

    #[test]
    fn failure_keeps_fetched_at_and_readings() {
        let mut s = LimitState::default();
        let t0 = Utc::now();
        s.apply_success(&full_report(), t0);
        let before = s.reading(Dimension::Requests).copied();

        s.apply_failure(&ProbeError::Parse("garbage".into()), t0 + Duration::seconds(60));
        assert_eq!(s.fetched_at(), Some(t0));
        assert_eq!(s.reading(Dimension::Requests).copied(), before);
        let err = s.last_error().unwrap();
        assert_eq!(err.kind, ErrorKind::Parse);
        assert!(err.message.contains("garbage"));
    }

    #[test]
    fn missing_dimension_retained_then_stale() {
        let mut s = LimitState::default();
        let t = Utc::now();
        s.apply_success(&full_report(), t);

        let partial = report(&[
            (Dimension::InputTokens, 1000, 500),
            (Dimension::Requests, 50, 40),
            (Dimension::TotalTokens, 1500, 1000),
        ]);
        for i in 1..STALE_AFTER_MISSES {
            s.apply_success(&partial, t);
            assert_eq!(s.slot(Dimension::OutputTokens).misses, i);
            assert_eq!(
                s.reading(Dimension::OutputTokens).map(|r| r.remaining()),
                Some(500),
                "retained after {} misses",
                i
            );
        }
        s.apply_success(&partial, t);
        assert!(s.is_stale(Dimension::OutputTokens));
        assert!(s.reading(Dimension::OutputTokens).is_none());
        assert_eq!(s.reading(Dimension::InputTokens).unwrap().remaining(), 500);

        // Reported again: fresh and counter reset.
        s.apply_success(&full_report(), t);
        assert!(!s.is_stale(Dimension::OutputTokens));
        assert_eq!(s.slot(Dimension::OutputTokens).misses, 0);
    }

    #[test]
    fn failures_do_not_count_as_misses() {
        let mut s = LimitState::default();
        let t = Utc::now();
        s.apply_success(&full_report(), t);
        for _ in 0..10 {
            s.apply_failure(&ProbeError::Network("down".into()), t);
        }
        assert!(Dimension::ALL.iter().all(|d| s.slot(*d).misses == 0));
        assert!(s.has_data());
    }

    #[test]
    fn rate_limited_updates_readings_without_fetched_at() {
        let mut s = LimitState::default();
        let t0 = Utc::now();
        s.apply_success(&full_report(), t0);

        let err = ProbeError::RateLimited {
            retry_after_secs: Some(12),
            partial: report(&[(Dimension::Requests, 50, 0)]),
        };
        s.apply_failure(&err, t0 + Duration::seconds(30));
        assert_eq!(s.fetched_at(), Some(t0));
        assert_eq!(s.reading(Dimension::Requests).unwrap().remaining(), 0);
        assert_eq!(s.last_error().unwrap().kind, ErrorKind::RateLimited);
        assert_eq!(s.slot(Dimension::OutputTokens).misses, 0);
    }
}
