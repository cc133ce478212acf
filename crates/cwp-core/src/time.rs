use chrono::{DateTime, Local, Utc};

pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Local ISO-8601 timestamp with microseconds, as written into status ledgers.
pub fn now_iso() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Timestamp safe to embed in a directory name, e.g. `2024-03-01-14:05:09`.
pub fn dir_stamp() -> String {
    Local::now().format("%Y-%m-%d-%H:%M:%S").to_string()
}

/// Suffix used to set a colliding name aside without destroying either copy.
pub fn collision_suffix() -> String {
    let now = Utc::now();
    format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros())
}

/// Human-readable timestamp for operator-facing text.
pub fn human(ts: &DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%a %b %e %H:%M:%S %Y").to_string()
}
