use std::collections::HashMap;
use std::time::Instant;

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Formats a byte count with IEC units ("1.5 MiB"). Values below 1 KiB keep
/// integer precision.
pub fn format_bytes(bytes: f64) -> String {
    let mut value = bytes.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", value.round() as u64, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Formats a transfer rate with IEC units ("12.3 MiB/s").
pub fn format_rate(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

/// Per-file transfer rate state: remembers the previous byte count and
/// timestamp for each file so a rate can be derived from consecutive
/// progress records.
#[derive(Default)]
pub struct RateTracker {
    seen: HashMap<String, (u64, Instant)>,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the current byte progress for `file` and returns the rate
    /// since the previous record, or an empty string for the first record
    /// (no interval to divide by yet).
    pub fn update(&mut self, file: &str, byte_progress: u64) -> String {
        let now = Instant::now();
        let rate = match self.seen.get(file) {
            Some((prev_bytes, prev_time)) => {
                let elapsed = now.duration_since(*prev_time).as_secs_f64();
                if elapsed > 0.0 {
                    let delta = byte_progress.saturating_sub(*prev_bytes) as f64;
                    format_rate(delta / elapsed)
                } else {
                    String::new()
                }
            }
            None => String::new(),
        };
        self.seen.insert(file.to_string(), (byte_progress, now));
        rate
    }

    /// Drops the state for a finished file.
    pub fn finish(&mut self, file: &str) {
        self.seen.remove(file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(0.0), "0 B");
        assert_eq!(format_bytes(512.0), "512 B");
        assert_eq!(format_bytes(1024.0), "1.0 KiB");
        assert_eq!(format_bytes(1536.0), "1.5 KiB");
        assert_eq!(format_bytes(52_428_800.0), "50.0 MiB");
        assert_eq!(format_bytes(3.5 * 1024.0 * 1024.0 * 1024.0), "3.5 GiB");
    }

    #[test]
    fn rate_formatting_matches_wire_pattern() {
        let re = regex::Regex::new(r"^\d+(\.\d+)? [KMG]i?B/s$").unwrap();
        assert!(re.is_match(&format_rate(12.3 * 1024.0 * 1024.0)));
        assert!(re.is_match(&format_rate(900.0 * 1024.0)));
    }

    #[test]
    fn tracker_first_record_has_no_rate() {
        let mut tracker = RateTracker::new();
        assert_eq!(tracker.update("big.nc", 1024), "");
    }

    #[test]
    fn tracker_rate_is_non_negative() {
        let mut tracker = RateTracker::new();
        tracker.update("big.nc", 4096);
        std::thread::sleep(std::time::Duration::from_millis(20));
        // Byte counts can repeat when the child re-reports; never negative.
        let rate = tracker.update("big.nc", 4096);
        assert!(rate.starts_with('0'), "rate was {}", rate);
    }

    #[test]
    fn tracker_is_per_file() {
        let mut tracker = RateTracker::new();
        tracker.update("a", 100);
        assert_eq!(tracker.update("b", 5000), "");
    }
}
