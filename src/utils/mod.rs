//! Errors, logging setup and the two formatting helpers the CLI prints with

pub mod error;
pub mod logging;

pub use error::{ClassifierError, Result};
pub use logging::{init_logging, LogConfig, LogLevel};

/// Fit durations: `42.0s`, `3m 07s`, `2h 05m`
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        return format!("{:.1}s", seconds);
    }

    let total = seconds.round() as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours == 0 {
        format!("{}m {:02}s", minutes, secs)
    } else {
        format!("{}h {:02}m", hours, minutes)
    }
}

/// Parameter counts grouped by thousands: `11,689,512`
pub fn format_number(n: usize) -> String {
    let digits = n.to_string();
    let groups: Vec<&str> = digits
        .as_bytes()
        .rchunks(3)
        .rev()
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .collect();
    groups.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42.0), "42.0s");
        assert_eq!(format_duration(187.2), "3m 07s");
        assert_eq!(format_duration(7500.0), "2h 05m");
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(7), "7");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(11_689_512), "11,689,512");
    }
}
