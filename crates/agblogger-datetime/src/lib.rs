//! Lax timestamp parsing and the canonical datetime format for agblogger.
//!
//! Every timestamp the platform persists is rendered in one canonical form:
//! `YYYY-MM-DD HH:MM:SS.ffffff±HHMM` (microsecond precision, explicit
//! offset). Parsing is deliberately forgiving: ISO 8601 with `T` or space,
//! any subset of the time fields, fractional seconds of 1 to 9 digits, an
//! offset written `+HHMM`, `+HH:MM`, or `Z`, or no offset at all. Naive
//! inputs are interpreted in the site's configured IANA timezone.
//!
//! # Example
//!
//! ```
//! use agblogger_datetime::{SiteTz, parse, format_canonical};
//!
//! let tz = SiteTz::utc();
//! let dt = parse("2024-03-01T09:30Z", &tz).expect("parse");
//! assert_eq!(format_canonical(&dt), "2024-03-01 09:30:00.000000+0000");
//! ```

use chrono::{
    DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use thiserror::Error;
use tracing::warn;

/// Canonical output format: microseconds, offset without colon.
const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f%z";

/// Errors produced by [`parse`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeError {
    /// The input matched none of the accepted datetime shapes.
    #[error("unparseable datetime: {0:?}")]
    BadFormat(String),
}

/// The site's display/interpretation timezone, validated against the IANA
/// database at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteTz(Tz);

impl SiteTz {
    /// Resolve a configured IANA timezone name.
    ///
    /// `None` or an unrecognized name falls back to UTC; the bad name is
    /// logged once here rather than surfaced to the caller, since a wrong
    /// `index.toml` must not take the site down.
    pub fn new(name: Option<&str>) -> Self {
        match name {
            None => Self(Tz::UTC),
            Some(raw) => match raw.parse::<Tz>() {
                Ok(tz) => Self(tz),
                Err(_) => {
                    warn!(timezone = raw, "unknown IANA timezone, falling back to UTC");
                    Self(Tz::UTC)
                }
            },
        }
    }

    /// UTC site timezone.
    pub fn utc() -> Self {
        Self(Tz::UTC)
    }

    /// The IANA name of the wrapped timezone.
    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    /// Attach this zone's offset to a naive local datetime.
    ///
    /// DST gaps resolve by re-reading the wall time as UTC; ambiguous wall
    /// times take the earlier of the two offsets.
    pub fn localize(&self, naive: NaiveDateTime) -> DateTime<FixedOffset> {
        match self.0.from_local_datetime(&naive) {
            chrono::LocalResult::Single(dt) => dt.fixed_offset(),
            chrono::LocalResult::Ambiguous(earlier, _) => earlier.fixed_offset(),
            chrono::LocalResult::None => self.0.from_utc_datetime(&naive).fixed_offset(),
        }
    }

    /// Current instant, carrying this zone's offset.
    pub fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.0).fixed_offset()
    }
}

impl Default for SiteTz {
    fn default() -> Self {
        Self::utc()
    }
}

/// Parse a lax timestamp into an offset-aware instant.
///
/// Inputs without an offset are interpreted in `tz`. Fractional seconds
/// beyond microseconds are truncated. Fails with [`TimeError::BadFormat`]
/// for anything outside the accepted set.
pub fn parse(input: &str, tz: &SiteTz) -> Result<DateTime<FixedOffset>, TimeError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(TimeError::BadFormat(input.to_string()));
    }

    let normalized = normalize_separators(trimmed);

    // Offset-bearing shapes first; `%#z` accepts both `+HHMM` and `+HH:MM`.
    for format in [
        "%Y-%m-%d %H:%M:%S%.f%#z",
        "%Y-%m-%d %H:%M%#z",
    ] {
        if let Ok(dt) = DateTime::parse_from_str(&normalized, format) {
            return Ok(truncate_to_micros(dt));
        }
    }

    // Naive shapes, interpreted in the site timezone.
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, format) {
            return Ok(truncate_to_micros(tz.localize(naive)));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(&normalized, "%Y-%m-%d") {
        let naive = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| TimeError::BadFormat(input.to_string()))?;
        return Ok(tz.localize(naive));
    }

    Err(TimeError::BadFormat(input.to_string()))
}

/// Render an instant in the canonical form.
pub fn format_canonical(dt: &DateTime<FixedOffset>) -> String {
    truncate_to_micros(*dt).format(CANONICAL_FORMAT).to_string()
}

/// Replace a `T` date/time separator with a space and a trailing zulu
/// marker with a numeric offset, so one family of chrono formats covers
/// the whole accepted set.
fn normalize_separators(s: &str) -> String {
    let mut out: String = s
        .char_indices()
        .map(|(i, c)| if i == 10 && (c == 'T' || c == 't') { ' ' } else { c })
        .collect();
    if out.ends_with('Z') || out.ends_with('z') {
        out.truncate(out.len() - 1);
        out.push_str("+0000");
    }
    out
}

fn truncate_to_micros(dt: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let micros_only = dt.nanosecond() / 1_000 * 1_000;
    // `with_nanosecond` only fails for values >= 2_000_000_000, which a
    // division by 1000 cannot produce.
    dt.with_nanosecond(micros_only).unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn utc() -> SiteTz {
        SiteTz::utc()
    }

    #[test]
    fn canonical_roundtrip() {
        let tz = utc();
        let dt = parse("2024-06-01 12:34:56.123456+0200", &tz).expect("parse");
        let rendered = format_canonical(&dt);
        assert_eq!(rendered, "2024-06-01 12:34:56.123456+0200");
        let reparsed = parse(&rendered, &tz).expect("reparse");
        assert_eq!(dt, reparsed);
    }

    #[test]
    fn accepts_t_separator() {
        let tz = utc();
        let a = parse("2024-06-01T12:00:00+0000", &tz).expect("T form");
        let b = parse("2024-06-01 12:00:00+0000", &tz).expect("space form");
        assert_eq!(a, b);
    }

    #[test]
    fn accepts_zulu_and_colon_offsets() {
        let tz = utc();
        let zulu = parse("2024-06-01T12:00:00Z", &tz).expect("zulu");
        let colon = parse("2024-06-01T14:00:00+02:00", &tz).expect("colon offset");
        let compact = parse("2024-06-01T14:00:00+0200", &tz).expect("compact offset");
        assert_eq!(zulu.timestamp(), colon.timestamp());
        assert_eq!(colon, compact);
    }

    #[test]
    fn date_only_defaults_to_midnight() {
        let dt = parse("2024-06-01", &utc()).expect("date only");
        assert_eq!(format_canonical(&dt), "2024-06-01 00:00:00.000000+0000");
    }

    #[test]
    fn minutes_only_defaults_seconds() {
        let dt = parse("2024-06-01 09:30", &utc()).expect("minutes");
        assert_eq!(format_canonical(&dt), "2024-06-01 09:30:00.000000+0000");
    }

    #[test]
    fn naive_input_uses_site_timezone() {
        let berlin = SiteTz::new(Some("Europe/Berlin"));
        let dt = parse("2024-06-01 12:00:00", &berlin).expect("naive");
        // June is CEST, +0200.
        assert_eq!(format_canonical(&dt), "2024-06-01 12:00:00.000000+0200");
    }

    #[test]
    fn nanoseconds_truncate_to_micros() {
        let dt = parse("2024-06-01 12:00:00.123456789+0000", &utc()).expect("nanos");
        assert_eq!(format_canonical(&dt), "2024-06-01 12:00:00.123456+0000");
    }

    #[test]
    fn short_fraction_pads_out() {
        let dt = parse("2024-06-01 12:00:00.5+0000", &utc()).expect("tenths");
        assert_eq!(format_canonical(&dt), "2024-06-01 12:00:00.500000+0000");
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "not a date", "2024-13-01", "2024-06-01 25:00:00", "06/01/2024"] {
            assert!(parse(bad, &utc()).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let tz = SiteTz::new(Some("Mars/Olympus_Mons"));
        assert_eq!(tz.name(), "UTC");
    }

    #[test]
    fn missing_timezone_is_utc() {
        assert_eq!(SiteTz::new(None).name(), "UTC");
    }

    #[test]
    fn localize_handles_dst_gap() {
        // 2024-03-31 02:30 does not exist in Europe/Berlin.
        let berlin = SiteTz::new(Some("Europe/Berlin"));
        let naive = NaiveDate::from_ymd_opt(2024, 3, 31)
            .expect("date")
            .and_hms_opt(2, 30, 0)
            .expect("time");
        // Must not panic; exact resolution is an implementation choice.
        let _ = berlin.localize(naive);
    }

    proptest! {
        #[test]
        fn format_of_parse_is_canonical(
            secs in 0i64..4_102_444_800, // through year 2099
            micros in 0u32..1_000_000,
            offset_mins in -14 * 60i32..=14 * 60,
        ) {
            let offset = FixedOffset::east_opt(offset_mins * 60).expect("offset");
            let dt = DateTime::<Utc>::from_timestamp(secs, micros * 1_000)
                .expect("timestamp")
                .with_timezone(&offset);
            let rendered = format_canonical(&dt);
            let reparsed = parse(&rendered, &SiteTz::utc()).expect("reparse");
            prop_assert_eq!(dt, reparsed);
            prop_assert_eq!(format_canonical(&reparsed), rendered);
        }
    }
}
