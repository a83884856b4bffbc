//! ISO-8601 observation window handling.
//!
//! The station schedules in UTC wall-clock time; the recorder schedules in
//! packet numbers. This module resolves the `-S`/`-T`/`-t` trio into a
//! concrete window and converts its endpoints onto the packet timeline.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use station_capture::packet_number;
use std::time::Duration;

pub const ISOT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Copy)]
pub struct ObservationWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub fn parse_isot(text: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(text, ISOT_FORMAT)
        .with_context(|| format!("failed to parse '{}' as YYYY-MM-DDTHH:MM:SS", text))?;
    Ok(naive.and_utc())
}

/// Packet number of the first packet of the second containing `time`.
pub fn packet_at(time: DateTime<Utc>, clock_200mhz: bool) -> Result<u64> {
    let secs = time.timestamp();
    let secs: u32 = secs
        .try_into()
        .with_context(|| format!("time {} is outside the packet timeline", time))?;
    Ok(packet_number(secs, 0, clock_200mhz))
}

/// Resolve start/end/length into a concrete window.
///
/// A missing start means "now"; a missing end means start plus `length_secs`.
/// Unless `skip_time_check` is set, a window that has already passed or that
/// ends before it starts is refused.
pub fn resolve_window(
    start: Option<&str>,
    end: Option<&str>,
    length_secs: f64,
    skip_time_check: bool,
) -> Result<ObservationWindow> {
    let now = Utc::now();

    let start_dt = match start {
        Some(text) => parse_isot(text)?,
        None => {
            let truncated = DateTime::<Utc>::from_timestamp(now.timestamp(), 0)
                .context("system clock is outside the representable range")?;
            tracing::info!(
                "start time not given; starting at the current time {}",
                truncated.format(ISOT_FORMAT)
            );
            truncated
        }
    };

    let end_dt = match end {
        Some(text) => parse_isot(text)?,
        None => {
            let end_dt = start_dt + ChronoDuration::milliseconds((length_secs * 1e3) as i64);
            tracing::info!(
                "end time set to {} ({}s after the start)",
                end_dt.format(ISOT_FORMAT),
                length_secs
            );
            end_dt
        }
    };

    if !skip_time_check {
        if end_dt < now {
            bail!("end time {} has already passed", end_dt.format(ISOT_FORMAT));
        }
        if end_dt <= start_dt {
            bail!(
                "end time {} is not after start time {}",
                end_dt.format(ISOT_FORMAT),
                start_dt.format(ISOT_FORMAT)
            );
        }
    }

    Ok(ObservationWindow { start: start_dt, end: end_dt })
}

/// Sleep until `lead_secs` before the start time; no-op if it is closer
/// than that (or already past).
pub fn sleep_until_near(start: DateTime<Utc>, lead_secs: f64) {
    let remaining = (start - Utc::now()).num_milliseconds() as f64 / 1e3;
    if remaining > lead_secs {
        tracing::info!(
            "observation starts in {:.0} s; sleeping until {:.0} s before the start",
            remaining,
            lead_secs
        );
        std::thread::sleep(Duration::from_secs_f64(remaining - lead_secs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_isot() {
        let t = parse_isot("2008-01-01T00:00:00").unwrap();
        assert_eq!(t.timestamp(), 1_199_145_600);
        assert!(parse_isot("2008-01-01 00:00:00").is_err());
        assert!(parse_isot("not-a-time").is_err());
    }

    #[test]
    fn test_packet_at_epoch() {
        let t = parse_isot("2008-01-01T00:00:00").unwrap();
        assert_eq!(packet_at(t, true).unwrap(), 14_638_007_812_500);
        assert_eq!(packet_at(t, false).unwrap(), 11_710_406_250_000);
    }

    #[test]
    fn test_window_defaults_to_length() {
        let window =
            resolve_window(Some("2100-01-01T12:00:00"), None, 60.0, false).unwrap();
        assert_eq!((window.end - window.start).num_seconds(), 60);
    }

    #[test]
    fn test_window_rejects_past_end() {
        let err = resolve_window(
            Some("2000-01-01T00:00:00"),
            Some("2000-01-01T00:01:00"),
            60.0,
            false,
        );
        assert!(err.is_err());
        // -C waives the check for replay runs.
        assert!(resolve_window(
            Some("2000-01-01T00:00:00"),
            Some("2000-01-01T00:01:00"),
            60.0,
            true,
        )
        .is_ok());
    }

    #[test]
    fn test_window_rejects_inverted_order() {
        assert!(resolve_window(
            Some("2100-01-02T00:00:00"),
            Some("2100-01-01T00:00:00"),
            60.0,
            false,
        )
        .is_err());
    }
}
