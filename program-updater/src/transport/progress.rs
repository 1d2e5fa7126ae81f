//! Byte-level progress tracking for downloads.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callback invoked after every chunk written to the destination
pub type ProgressCallback = Arc<dyn Fn(&TransferProgress) + Send + Sync>;

/// Callback that discards progress updates
pub fn no_progress() -> ProgressCallback {
    Arc::new(|_: &TransferProgress| {})
}

/// Progress of a single transfer
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Bytes written so far
    pub bytes_read: u64,

    /// Length declared by the server, if any
    pub content_length: Option<u64>,

    started: Instant,
}

impl TransferProgress {
    /// Create a new progress tracker
    pub fn new(content_length: Option<u64>) -> Self {
        Self {
            bytes_read: 0,
            content_length,
            started: Instant::now(),
        }
    }

    /// Record another chunk of `count` bytes
    pub fn advance(&mut self, count: usize) {
        self.bytes_read += count as u64;
    }

    /// Whole percent complete, `None` while the length is unknown.
    pub fn percent(&self) -> Option<u8> {
        match self.content_length {
            Some(0) => Some(100),
            Some(total) => Some((self.bytes_read.saturating_mul(100) / total).min(100) as u8),
            None => None,
        }
    }

    /// Status line for the reporter
    pub fn label(&self) -> String {
        match self.percent() {
            Some(percent) => format!("Downloading... {}%", percent),
            None => format!("Downloading... {}", format_bytes(self.bytes_read)),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Get average speed since start
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.bytes_read as f64 / elapsed) as u64
        } else {
            0
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}
