//! Bounded capture of worker launch output.

use std::collections::VecDeque;
use std::sync::Arc;

/// Callback invoked for every captured output line.
pub type LineListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Keeps the most recent lines of combined stdout/stderr, up to a byte limit.
///
/// When the limit is exceeded the oldest lines are dropped, so the tail
/// (usually where the failure is) survives.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
    dropped: usize,
    capturing: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit,
            dropped: 0,
            capturing: true,
        }
    }

    /// Append a line if capture is still active.
    pub fn push_line(&mut self, line: &str) -> bool {
        if !self.capturing {
            return false;
        }
        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_string());
        while self.bytes > self.limit {
            match self.lines.pop_front() {
                Some(old) => {
                    self.bytes -= old.len() + 1;
                    self.dropped += 1;
                }
                None => break,
            }
        }
        true
    }

    /// Stop recording new lines. Already captured lines are kept.
    pub fn stop_capture(&mut self) {
        self.capturing = false;
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Captured text, newline separated.
    pub fn contents(&self) -> String {
        let mut out = String::with_capacity(self.bytes + 48);
        if self.dropped > 0 {
            out.push_str(&format!("[... {} earlier lines truncated ...]\n", self.dropped));
        }
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}
