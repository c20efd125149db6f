//! Utility functions.

/// Seed libtorch's generator (used for weight init, imagine groups and
/// message sampling).
pub fn set_seed(seed: u64) {
    tch::manual_seed(seed as i64);
}

/// Abbreviate large step counts for display
pub fn abbreviate(num: u64) -> String {
    if num < 1_000 {
        format!("{}", num)
    } else if num < 1_000_000 {
        format!("{:.1}K", num as f64 / 1_000.0)
    } else if num < 1_000_000_000 {
        format!("{:.1}M", num as f64 / 1_000_000.0)
    } else {
        format!("{:.1}B", num as f64 / 1_000_000_000.0)
    }
}

/// Format duration in human-readable form
pub fn format_duration(seconds: f64) -> String {
    if seconds < 0.0 {
        return "0s".to_string();
    }

    let secs = seconds as u64;
    let d = secs / 86_400;
    let h = (secs % 86_400) / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;

    if d > 0 {
        format!("{}d {}h {}m", d, h, m)
    } else if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// Estimate the wall-clock time left, extrapolating the rate observed
/// between `last_t` and `current_t` over `elapsed` seconds.
pub fn time_left(elapsed: f64, last_t: u64, current_t: u64, t_max: u64) -> String {
    if current_t >= t_max || current_t <= last_t {
        return "-".to_string();
    }
    let rate = elapsed / (current_t - last_t) as f64;
    format_duration(rate * (t_max - current_t) as f64)
}
