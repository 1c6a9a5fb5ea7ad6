pub mod awakeable;
pub mod events;
pub mod job;
pub mod timeout;

use chrono::{DateTime, Utc};

/// Short local-time rendering for list output.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}
