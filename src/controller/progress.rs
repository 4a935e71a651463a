//! Import progress scaling.
//!
//! The importer reports its own 0-100% progress. A disk may dedicate only a
//! slice of its progress to the import, so the raw value is mapped linearly
//! into a range. Reported progress never moves backwards.

/// Percentage range an import is mapped into.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressRange {
    low: f64,
    high: f64,
}

impl Default for ProgressRange {
    fn default() -> Self {
        Self {
            low: 0.0,
            high: 100.0,
        }
    }
}

impl ProgressRange {
    /// Range `[low, high]`, clamped to 0-100 and ordered.
    pub fn new(low: f64, high: f64) -> Self {
        let low = low.clamp(0.0, 100.0);
        let high = high.clamp(0.0, 100.0);
        Self {
            low: low.min(high),
            high: low.max(high),
        }
    }

    /// Map a raw percentage (0-100) into the range.
    pub fn scale(&self, raw: f64) -> f64 {
        let raw = raw.clamp(0.0, 100.0);
        self.low + (self.high - self.low) * raw / 100.0
    }
}

/// Parse a percentage such as `"45.12%"`. `"N/A"` and empty strings are
/// not progress.
pub fn parse_percent(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("N/A") {
        return None;
    }
    value
        .trim_end_matches('%')
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

pub fn format_percent(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}%")
    } else {
        format!("{value:.1}%")
    }
}

/// Next progress to report for a disk.
///
/// Without a usable raw value the previous progress is kept; otherwise the
/// scaled value is reported unless it would go below the previous one.
pub fn next_progress(raw: Option<&str>, previous: Option<&str>, range: ProgressRange) -> Option<String> {
    let previous_value = previous.and_then(parse_percent);
    let Some(scaled) = raw.and_then(parse_percent).map(|v| range.scale(v)) else {
        return previous.map(String::from);
    };
    match previous_value {
        Some(prev) if prev > scaled => previous.map(String::from),
        _ => Some(format_percent(scaled)),
    }
}
