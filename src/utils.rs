use std::time::Duration;

pub struct Utils {}

impl Utils {
    /// Format a duration as a compact human readable string (`45s`, `3m 07s`, `1h 02m 03s`).
    pub fn format_elapsed(elapsed: Duration) -> String {
        let total = elapsed.as_secs();
        let hours = total / 3600;
        let minutes = (total % 3600) / 60;
        let seconds = total % 60;

        if hours > 0 {
            format!("{}h {:02}m {:02}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {:02}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }
}
