use std::time::Duration;

/// Ceiling on the delay between engine recreation attempts, in seconds.
pub const MAX_BACKOFF_SECS: f64 = 120.0;

/// Delay in seconds before recreating a failed engine for the `attempts`-th
/// time: `attempts^e * 0.1`, capped at two minutes.
pub fn backoff(attempts: u32) -> f64 {
    if attempts > 13 {
        return MAX_BACKOFF_SECS;
    }
    (f64::from(attempts).powf(std::f64::consts::E) * 0.1).min(MAX_BACKOFF_SECS)
}

pub fn backoff_duration(attempts: u32) -> Duration {
    Duration::from_secs_f64(backoff(attempts))
}
