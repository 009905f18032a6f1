use rand::distributions::Alphanumeric;
use rand::Rng;

/// Short random identifier for sessions, pushers and pull clients.
pub fn short_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

/// Wall-clock seconds since the unix epoch.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
