//! Turns a streamed model answer into renderable HTML snapshots.
//!
//! The answer may start with prose; only the text from `<!DOCTYPE html>` on is
//! rendered. While the document is still open a closing `</html>` is forced so
//! the snapshot parses, and snapshots are throttled to one per interval. The
//! first real `</html>` finalizes the document.

use std::time::{Duration, Instant};

pub const RENDER_INTERVAL: Duration = Duration::from_millis(300);
const DOCTYPE: &str = "<!doctype html>";
const CLOSE_TAG: &str = "</html>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Render {
    /// Snapshot of a document still being written.
    Partial(String),
    /// The complete document.
    Final(String),
}

#[derive(Debug)]
pub struct PreviewRenderer {
    buffer: String,
    interval: Duration,
    last_render: Option<Instant>,
    finished: Option<String>,
}

impl Default for PreviewRenderer {
    fn default() -> Self {
        Self::new(RENDER_INTERVAL)
    }
}

impl PreviewRenderer {
    pub fn new(interval: Duration) -> Self {
        Self {
            buffer: String::new(),
            interval,
            last_render: None,
            finished: None,
        }
    }

    pub fn push(&mut self, chunk: &str) -> Option<Render> {
        self.push_at(chunk, Instant::now())
    }

    /// Feed one chunk observed at `now`.
    pub fn push_at(&mut self, chunk: &str, now: Instant) -> Option<Render> {
        if self.finished.is_some() {
            return None;
        }
        self.buffer.push_str(chunk);

        let start = find_ascii_ci(&self.buffer, DOCTYPE)?;
        let doc = &self.buffer[start..];

        if let Some(end) = find_ascii_ci(doc, CLOSE_TAG) {
            let complete = doc[..end + CLOSE_TAG.len()].to_string();
            self.finished = Some(complete.clone());
            return Some(Render::Final(complete));
        }

        let due = self
            .last_render
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
        if !due {
            return None;
        }
        self.last_render = Some(now);
        Some(Render::Partial(format!("{doc}\n{CLOSE_TAG}")))
    }

    /// Completed document, if the closing tag has been seen.
    pub fn document(&self) -> Option<&str> {
        self.finished.as_deref()
    }

    /// Best effort document once the stream ends: the finished document, or the
    /// open one force-closed.
    pub fn finish(&self) -> Option<String> {
        if let Some(done) = &self.finished {
            return Some(done.clone());
        }
        let start = find_ascii_ci(&self.buffer, DOCTYPE)?;
        Some(format!("{}\n{CLOSE_TAG}", &self.buffer[start..]))
    }

    /// Everything received so far, prose included.
    pub fn raw(&self) -> &str {
        &self.buffer
    }
}

/// Byte offset of an ASCII `needle` in `haystack`, ignoring ASCII case.
fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    let needle = needle.as_bytes();
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}
