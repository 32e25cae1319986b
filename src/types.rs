use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the four rate-limit categories the provider reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    InputTokens,
    OutputTokens,
    Requests,
    TotalTokens,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::InputTokens,
        Dimension::OutputTokens,
        Dimension::Requests,
        Dimension::TotalTokens,
    ];

    // Segment used in `anthropic-ratelimit-<prefix>-{limit,remaining,reset}`.
    pub fn header_prefix(self) -> &'static str {
        match self {
            Dimension::InputTokens => "input-tokens",
            Dimension::OutputTokens => "output-tokens",
            Dimension::Requests => "requests",
            Dimension::TotalTokens => "tokens",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Dimension::InputTokens => "Input Tokens",
            Dimension::OutputTokens => "Output Tokens",
            Dimension::Requests => "Requests",
            Dimension::TotalTokens => "Total Tokens",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Dimension::InputTokens => "input_tokens",
            Dimension::OutputTokens => "output_tokens",
            Dimension::Requests => "requests",
            Dimension::TotalTokens => "total_tokens",
        };
        f.write_str(s)
    }
}

/// Limit, remaining and reset for a single dimension as of one probe.
///
/// `remaining` is always within `0..=limit`; the constructor clamps provider
/// values that violate this (negative counts, remaining above limit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawReading")]
pub struct DimensionReading {
    limit: u64,
    remaining: u64,
    reset_at: Option<DateTime<Utc>>,
}

// Deserialized values go through the same clamp as `new`.
#[derive(Deserialize)]
struct RawReading {
    limit: u64,
    remaining: u64,
    #[serde(default)]
    reset_at: Option<DateTime<Utc>>,
}

impl From<RawReading> for DimensionReading {
    fn from(raw: RawReading) -> Self {
        Self {
            limit: raw.limit,
            remaining: raw.remaining.min(raw.limit),
            reset_at: raw.reset_at,
        }
    }
}

impl DimensionReading {
    pub fn new(limit: i64, remaining: i64, reset_at: Option<DateTime<Utc>>) -> Self {
        let limit = limit.max(0) as u64;
        let remaining = (remaining.max(0) as u64).min(limit);
        Self {
            limit,
            remaining,
            reset_at,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn used(&self) -> u64 {
        self.limit.saturating_sub(self.remaining)
    }

    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        self.reset_at
    }

    pub fn ratio(&self) -> f64 {
        crate::capacity::ratio(self.limit, self.remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_clamps_into_valid_range() {
        let r = DimensionReading::new(1000, 1500, None);
        assert_eq!(r.remaining(), 1000);
        assert_eq!(r.used(), 0);

        let r = DimensionReading::new(1000, -5, None);
        assert_eq!(r.remaining(), 0);

        let r = DimensionReading::new(-1, 10, None);
        assert_eq!(r.limit(), 0);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn deserialized_reading_is_clamped() {
        let r: DimensionReading =
            serde_json::from_str(r#"{"limit":10,"remaining":50,"reset_at":null}"#).unwrap();
        assert_eq!(r.limit(), 10);
        assert_eq!(r.remaining(), 10);
        assert_eq!(r.used(), 0);
        assert_eq!(r.ratio(), 1.0);

        let r: DimensionReading = serde_json::from_str(r#"{"limit":10,"remaining":4}"#).unwrap();
        assert_eq!(r.used(), 6);
        assert!(r.reset_at().is_none());
    }

    #[test]
    fn header_prefixes_match_provider_names() {
        let prefixes: Vec<_> = Dimension::ALL.iter().map(|d| d.header_prefix()).collect();
        assert_eq!(
            prefixes,
            vec!["input-tokens", "output-tokens", "requests", "tokens"]
        );
    }

    #[test]
    fn dimension_serializes_snake_case() {
        let v = serde_json::to_value(Dimension::TotalTokens).unwrap();
        assert_eq!(v, serde_json::json!("total_tokens"));
        assert_eq!(Dimension::InputTokens.to_string(), "input_tokens");
    }
}
