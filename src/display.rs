//! Text rendering of snapshots: compact counts, bars, countdowns, titles.
//! Any presentation layer (tray, menu, terminal) can build on these.

use crate::capacity::{CapacityView, UNKNOWN_GLYPH};
use crate::http::ErrorKind;
use crate::state::{LastError, LimitState};
use crate::types::{Dimension, DimensionReading};
use chrono::{DateTime, Local, Utc};

pub const BAR_WIDTH: usize = 20;

// Dimensions whose reset time is shown, in order of preference.
const RESET_PREFERENCE: [Dimension; 3] = [
    Dimension::InputTokens,
    Dimension::TotalTokens,
    Dimension::Requests,
];

/// 1_500_000 -> "1.5M", 42_000 -> "42.0K", 999 -> "999".
pub fn format_count(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

/// `████████░░░░░░░░░░░░` for a 0-100 percentage.
pub fn render_bar(percent: f64, width: usize) -> String {
    let pct = if percent.is_finite() {
        percent.clamp(0.0, 100.0)
    } else {
        0.0
    };
    let filled = ((width as f64) * pct / 100.0).round() as usize;
    let filled = filled.min(width);
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

pub fn dimension_line(dim: Dimension, reading: Option<&DimensionReading>) -> String {
    match reading {
        Some(r) => format!(
            "{:<13}: {} used / {}  ({:.0}% left)",
            dim.label(),
            format_count(r.used()),
            format_count(r.limit()),
            r.ratio() * 100.0
        ),
        None => format!("{:<13}: —", dim.label()),
    }
}

pub fn bar_line(reading: &DimensionReading) -> String {
    format!(
        "  {}  {} remaining",
        render_bar(reading.ratio() * 100.0, BAR_WIDTH),
        format_count(reading.remaining())
    )
}

/// First known reset time, preferring input tokens, then total, then requests.
pub fn next_reset(state: &LimitState) -> Option<DateTime<Utc>> {
    RESET_PREFERENCE
        .iter()
        .filter_map(|d| state.reading(*d).and_then(|r| r.reset_at()))
        .next()
}

pub fn reset_countdown(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (reset_at - now).num_seconds();
    if secs > 0 {
        format!("Resets in {}m {}s", secs / 60, secs % 60)
    } else {
        "Limit window just reset".to_string()
    }
}

pub fn ago(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0);
    match secs {
        0..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        _ => format!("{}h {}m ago", secs / 3600, (secs % 3600) / 60),
    }
}

pub fn last_checked(state: &LimitState) -> String {
    match state.fetched_at() {
        Some(t) => format!(
            "Last checked: {}",
            t.with_timezone(&Local).format("%-I:%M:%S %p")
        ),
        None => "Last checked: never".to_string(),
    }
}

/// Short tray title, e.g. `● 62%`, `◉ Bad Key`, `◉ —`.
pub fn tray_title(state: &LimitState, view: &CapacityView) -> String {
    if let Some(err) = state.last_error() {
        match err.kind {
            ErrorKind::Auth => return format!("{} Bad Key", UNKNOWN_GLYPH),
            ErrorKind::Network if !state.has_data() => {
                return format!("{} offline", UNKNOWN_GLYPH)
            }
            _ => {}
        }
    }
    match (view.aggregate, view.min_percent) {
        (Some(sym), Some(pct)) => format!("{} {:.0}%", sym.glyph(), pct),
        _ => format!("{} —", UNKNOWN_GLYPH),
    }
}

pub fn error_status(err: &LastError) -> String {
    let text = match err.kind {
        ErrorKind::Auth => "Invalid API key".to_string(),
        ErrorKind::RateLimited => "Rate limited".to_string(),
        ErrorKind::Network => "No connection".to_string(),
        ErrorKind::Parse | ErrorKind::Api => err.message.chars().take(80).collect(),
    };
    format!("⚠ {}", text)
}

/// Top status line: capacity summary, or the error plus how stale the data is.
pub fn status_line(state: &LimitState, view: &CapacityView, now: DateTime<Utc>) -> String {
    if let Some(err) = state.last_error() {
        return match state.fetched_at() {
            Some(t) => format!("{} (last updated {})", error_status(err), ago(t, now)),
            None => error_status(err),
        };
    }
    match view.min_percent {
        Some(pct) => format!("Token Meter — {:.0}% capacity left", pct),
        None => "Token Meter — no data".to_string(),
    }
}

/// Multi-line report with the same rows the menu shows.
pub fn render_report(state: &LimitState, view: &CapacityView, now: DateTime<Utc>) -> String {
    let mut lines = vec![tray_title(state, view), status_line(state, view, now)];
    for dim in Dimension::ALL {
        let reading = state.reading(dim);
        lines.push(dimension_line(dim, reading));
        if let Some(r) = reading {
            lines.push(bar_line(r));
        }
    }
    if let Some(reset) = next_reset(state) {
        lines.push(reset_countdown(reset, now));
    }
    lines.push(last_checked(state));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ProbeError, ProbeReport};
    use chrono::Duration;

    fn state_with(dims: &[(Dimension, i64, i64)]) -> LimitState {
        let mut report = ProbeReport::default();
        for (d, l, r) in dims {
            report.insert(*d, DimensionReading::new(*l, *r, None));
        }
        let mut s = LimitState::default();
        s.apply_success(&report, Utc::now());
        s
    }

    #[test]
    fn compact_counts() {
        assert_eq!(format_count(1_500_000), "1.5M");
        assert_eq!(format_count(42_000), "42.0K");
        assert_eq!(format_count(1_000), "1.0K");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(0), "0");
    }

    #[test]
    fn bars() {
        assert_eq!(render_bar(0.0, 10), "░".repeat(10));
        assert_eq!(render_bar(100.0, 10), "█".repeat(10));
        assert_eq!(render_bar(50.0, 4), "██░░");
        assert_eq!(render_bar(250.0, 4), "████");
        assert_eq!(render_bar(f64::NAN, 4), "░░░░");
    }

    #[test]
    fn countdown() {
        let now = Utc::now();
        assert_eq!(
            reset_countdown(now + Duration::seconds(192), now),
            "Resets in 3m 12s"
        );
        assert_eq!(reset_countdown(now - Duration::seconds(5), now), "Limit window just reset");
    }

    #[test]
    fn title_shows_worst_dimension() {
        let s = state_with(&[
            (Dimension::InputTokens, 1000, 900),
            (Dimension::Requests, 100, 40),
        ]);
        let view = CapacityView::from_state(&s);
        assert_eq!(tray_title(&s, &view), "◐ 40%");
        assert_eq!(
            dimension_line(Dimension::Requests, s.reading(Dimension::Requests)),
            "Requests     : 60 used / 100  (40% left)"
        );
    }

    #[test]
    fn title_without_data() {
        let s = LimitState::default();
        let view = CapacityView::from_state(&s);
        assert_eq!(tray_title(&s, &view), "◉ —");
        assert_eq!(status_line(&s, &view, Utc::now()), "Token Meter — no data");
    }

    #[test]
    fn auth_error_title_and_status() {
        let mut s = state_with(&[(Dimension::InputTokens, 1000, 900)]);
        let now = Utc::now();
        s.apply_failure(
            &ProbeError::Auth {
                status: 401,
                message: "invalid x-api-key".into(),
            },
            now,
        );
        let view = CapacityView::from_state(&s);
        assert_eq!(tray_title(&s, &view), "◉ Bad Key");
        assert!(status_line(&s, &view, now).starts_with("⚠ Invalid API key (last updated"));
    }

    #[test]
    fn offline_without_data() {
        let mut s = LimitState::default();
        s.apply_failure(&ProbeError::Network("dns".into()), Utc::now());
        let view = CapacityView::from_state(&s);
        assert_eq!(tray_title(&s, &view), "◉ offline");
        assert_eq!(status_line(&s, &view, Utc::now()), "⚠ No connection");
    }

    #[test]
    fn ago_formats() {
        let now = Utc::now();
        assert_eq!(ago(now - Duration::seconds(5), now), "5s ago");
        assert_eq!(ago(now - Duration::seconds(125), now), "2m ago");
        assert_eq!(ago(now - Duration::seconds(3725), now), "1h 2m ago");
    }

    #[test]
    fn report_lists_every_dimension() {
        let s = state_with(&[(Dimension::TotalTokens, 48_000, 12_000)]);
        let view = CapacityView::from_state(&s);
        let out = render_report(&s, &view, Utc::now());
        for dim in Dimension::ALL {
            assert!(out.contains(dim.label()), "missing {}", dim.label());
        }
        assert!(out.contains("12.0K remaining"));
        assert!(out.contains("Last checked: "));
    }
}
