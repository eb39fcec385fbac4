//! Human-readable sizes and durations for logs and the CLI.

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// `512 B`, `1.5 KB`, `20.0 MB`, `4.27 GB`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < KB {
        format!("{bytes} B")
    } else if bytes < MB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    }
}

/// `42s`, `3m 5s`, `1h 2m 3s`. Fractions are truncated.
pub fn format_duration(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    if total < 60 {
        return format!("{total}s");
    }
    let minutes = total / 60;
    let secs = total % 60;
    if minutes < 60 {
        return format!("{minutes}m {secs}s");
    }
    format!("{}h {}m {}s", minutes / 60, minutes % 60, secs)
}
