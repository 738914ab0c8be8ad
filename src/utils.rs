/// Utility functions for identifier derivation, timestamps and averaging
use log::debug;
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{format_description, OffsetDateTime, PrimitiveDateTime};

/// Separator between the drone prefix and the sensor suffix of a sensor id
const SENSOR_ID_SEPARATOR: char = '_';

/// Resolve the drone a reading belongs to
///
/// An explicit, non-empty drone id wins. Otherwise the prefix of the sensor
/// id up to its first separator is used; a sensor id without a separator is
/// taken whole. Returns None when nothing usable is present.
pub fn derive_drone_id(drone_id: Option<&str>, sensor_id: Option<&str>) -> Option<String> {
    if let Some(id) = drone_id.map(str::trim).filter(|id| !id.is_empty()) {
        return Some(id.to_string());
    }

    let sensor_id = sensor_id?.trim();
    let prefix = sensor_id
        .split(SENSOR_ID_SEPARATOR)
        .next()
        .unwrap_or_default();

    if prefix.is_empty() {
        None
    } else {
        Some(prefix.to_string())
    }
}

/// Parse an ISO-8601 timestamp, substituting the current time on failure
///
/// Accepts RFC 3339 (`2024-05-01T12:00:00Z`, offsets, fractional seconds)
/// and offset-less ISO-8601 which is taken as UTC. A space may stand in
/// for the `T` between date and time.
pub fn parse_timestamp(raw: &str) -> OffsetDateTime {
    let raw = raw.trim();
    let normalized;
    let candidate = if raw.as_bytes().get(10) == Some(&b' ') {
        normalized = format!("{}T{}", &raw[..10], &raw[11..]);
        normalized.as_str()
    } else {
        raw
    };

    if let Ok(ts) = OffsetDateTime::parse(candidate, &Rfc3339) {
        return ts;
    }
    if let Ok(ts) = PrimitiveDateTime::parse(candidate, &Iso8601::DEFAULT) {
        return ts.assume_utc();
    }

    debug!("Unparseable timestamp '{}', using current time", raw);
    OffsetDateTime::now_utc()
}

/// Format a timestamp as `YYYY-MM-DDTHH:MM:SSZ` in UTC for the collector
pub fn format_summary_timestamp(dt: &OffsetDateTime) -> String {
    let utc = dt.to_offset(time::UtcOffset::UTC);
    format_description::parse("[year]-[month]-[day]T[hour]:[minute]:[second]Z")
        .ok()
        .and_then(|format| utc.format(&format).ok())
        .unwrap_or_else(|| utc.to_string())
}

/// Arithmetic mean, None for an empty input
pub fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Max minus min of the values, None for an empty input
pub fn spread(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    values
        .into_iter()
        .fold(None, |acc: Option<(f64, f64)>, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
        .map(|(lo, hi)| hi - lo)
}
