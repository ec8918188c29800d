use chrono::{SecondsFormat, Utc};

/// Render the current wall-clock time the way access logs expect it.
pub fn render_current_time() -> String {
	Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
