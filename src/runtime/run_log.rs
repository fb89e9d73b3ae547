//! In-memory run log for one job
//!
//! Subprocess output and inbound `Log` calls accumulate here; the buffer
//! is persisted through the coordinator when the job finishes, and
//! mirrored incrementally while running when debug logging is requested.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct RunLog {
    buffer: Mutex<String>,
    mirrored: AtomicBool,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line
    pub fn append(&self, line: &str) {
        let mut buffer = self.buffer.lock();
        buffer.push_str(line);
        buffer.push('\n');
    }

    /// Current contents
    pub fn snapshot(&self) -> String {
        self.buffer.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Whether the next mirrored chunk is the first for this attempt;
    /// flips to false on first call.
    pub fn take_first_mirror(&self) -> bool {
        !self.mirrored.swap(true, Ordering::SeqCst)
    }
}
