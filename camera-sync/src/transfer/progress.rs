//! Item-level progress tracking for copy and upload jobs.
//!
//! Progress is reported per item ("Uploading item 3 of 10"), never per byte.
//! Byte counters feed the debug log and the end-of-job summary.

use std::time::Duration;

/// Progress through a job's work list
#[derive(Debug, Clone)]
pub struct ItemProgress {
    /// "Copying" or "Uploading"
    verb: &'static str,
    total_items: usize,
    total_bytes: u64,
    done_bytes: u64,
}

impl ItemProgress {
    pub fn new(verb: &'static str, total_items: usize, total_bytes: u64) -> Self {
        Self {
            verb,
            total_items,
            total_bytes,
            done_bytes: 0,
        }
    }

    /// Message for the item at zero-based `index`.
    pub fn message(&self, index: usize) -> String {
        format!("{} item {} of {}", self.verb, index + 1, self.total_items)
    }

    /// Count a confirmed item; returns whole percent of bytes done.
    pub fn complete(&mut self, bytes: u64) -> u8 {
        self.done_bytes = self.done_bytes.saturating_add(bytes).min(self.total_bytes);
        if self.total_bytes == 0 {
            return 100;
        }
        (self.done_bytes.saturating_mul(100) / self.total_bytes) as u8
    }
}

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;

/// Sizes as the operator reads them: "512 B", "3.4 MB", "1.2 GB".
pub fn format_bytes(bytes: u64) -> String {
    match bytes {
        b if b >= GIB => format!("{:.1} GB", b as f64 / GIB as f64),
        b if b >= MIB => format!("{:.1} MB", b as f64 / MIB as f64),
        b if b >= KIB => format!("{:.1} KB", b as f64 / KIB as f64),
        b => format!("{} B", b),
    }
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m {}s", secs / 60, secs % 60),
        _ => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
    }
}
