//! Bounded line ring fed by raw subprocess output.

use chrono::Local;
use std::sync::Mutex;

pub const DEFAULT_MAX_LINES: usize = 500;
const MAX_LINE_LEN: usize = 2000;

/// One page of log lines, cursor-addressed so pollers can resume.
#[derive(Debug, Clone)]
pub struct LogsPage {
    pub lines: Vec<String>,
    pub next_cursor: Option<u64>,
    pub has_more: bool,
}

struct Inner {
    lines: Vec<String>,
    /// Carry for a line split across write chunks.
    partial: String,
    /// Total lines ever pushed; addresses survive ring eviction.
    cursor: u64,
    max_lines: usize,
}

/// Thread-safe ring of timestamped miner output lines.
///
/// The writer accepts arbitrary byte chunks: lines are split on `\n`,
/// empties discarded, oversize lines truncated, and each entry prefixed
/// with `[HH:MM:SS]`. When the ring overflows, the oldest entries drop and
/// the backing storage is shrunk back to the cap.
pub struct LogBuffer {
    inner: Mutex<Inner>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lines: Vec::new(),
                partial: String::new(),
                cursor: 0,
                max_lines: max_lines.max(1),
            }),
        }
    }

    pub fn write_chunk(&self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for c in text.chars() {
            if c == '\n' {
                let line = std::mem::take(&mut inner.partial);
                push_line(&mut inner, &line);
            } else {
                inner.partial.push(c);
            }
        }
    }

    /// Push a complete line directly (used by in-process miners).
    pub fn push(&self, line: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        push_line(&mut inner, line);
    }

    /// Copy of the current ring contents.
    pub fn snapshot(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.lines.clone()
    }

    /// Cursor-addressed page; `cursor` is the value returned by a previous
    /// call, or `None` to start from the oldest retained line.
    pub fn page(&self, cursor: Option<u64>, limit: usize) -> LogsPage {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let oldest = inner.cursor - inner.lines.len() as u64;
        let start = match cursor {
            Some(c) if c > oldest => (c - oldest) as usize,
            _ => 0,
        };
        let start = start.min(inner.lines.len());
        let lines: Vec<String> = inner.lines[start..]
            .iter()
            .take(limit)
            .cloned()
            .collect();
        let consumed = oldest + start as u64 + lines.len() as u64;
        let has_more = consumed < inner.cursor;
        LogsPage {
            lines,
            next_cursor: Some(consumed),
            has_more,
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

fn push_line(inner: &mut Inner, line: &str) {
    if line.is_empty() {
        return;
    }
    let body = if line.chars().count() > MAX_LINE_LEN {
        let head: String = line.chars().take(MAX_LINE_LEN).collect();
        format!("{}… [truncated]", head)
    } else {
        line.to_string()
    };
    let stamped = format!("[{}] {}", Local::now().format("%H:%M:%S"), body);

    if inner.lines.len() >= inner.max_lines {
        let overflow = inner.lines.len() + 1 - inner.max_lines;
        inner.lines.drain(..overflow);
        // Release memory held by evicted entries.
        let cap = inner.max_lines;
        inner.lines.shrink_to(cap);
    }
    inner.lines.push(stamped);
    inner.cursor += 1;
}
