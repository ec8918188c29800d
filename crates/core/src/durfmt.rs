//! Go-style duration strings ("250ms", "1h30m") for config files and logs.

use std::time::Duration;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
	#[error("invalid duration: {0}")]
	Invalid(String),
}

pub fn parse(s: &str) -> Result<Duration, Error> {
	let nanos = go_parse_duration::parse_duration(s).map_err(|e| match e {
		go_parse_duration::Error::ParseError(msg) => Error::Invalid(msg),
	})?;
	if nanos < 0 {
		return Err(Error::Invalid(format!("negative duration not allowed: {s}")));
	}
	Ok(Duration::from_nanos(nanos as u64))
}

pub fn format(d: Duration) -> String {
	durationfmt::to_string(truncate_for_display(d))
}

// Durations in logs don't need nanosecond precision; keep at most three
// significant sub-second digits so "1.234567891s" renders as "1.235s".
fn truncate_for_display(d: Duration) -> Duration {
	if d <= Duration::from_millis(1) {
		return d;
	}
	let secs = d.as_secs();
	let nanos = d.subsec_nanos();
	if secs < 1 {
		// sub-second: keep microsecond precision
		Duration::new(0, (nanos / 1_000) * 1_000 + round_digit(nanos, 1_000))
	} else {
		let rounded = ((nanos as f64) / 1_000_000.0).round() as u32 * 1_000_000;
		if rounded >= 1_000_000_000 {
			Duration::new(secs.saturating_add(1), 0)
		} else {
			Duration::new(secs, rounded)
		}
	}
}

fn round_digit(nanos: u32, unit: u32) -> u32 {
	if nanos % unit >= unit / 2 { unit } else { 0 }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_valid() {
		assert_eq!(parse("250ms").unwrap(), Duration::from_millis(250));
		assert_eq!(parse("1h30m").unwrap(), Duration::from_secs(5400));
		assert_eq!(parse("60s").unwrap(), Duration::from_secs(60));
	}

	#[test]
	fn parse_negative_rejected() {
		assert!(parse("-5s").is_err());
		assert!(parse("bogus").is_err());
	}

	#[test]
	fn format_round_trips_common_values() {
		assert_eq!(format(Duration::from_secs(0)), "0s");
		assert_eq!(format(Duration::from_millis(2200)), "2.2s");
		assert_eq!(format(Duration::from_secs(4 * 60 + 5)), "4m5s");
		assert_eq!(format(Duration::new(553, 123_000_000)), "9m13.123s");
	}
}
