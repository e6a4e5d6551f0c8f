//! Output capture for sandboxed `print` and guest output.
//!
//! Every exec gets its own frame, so output written by a nested exec (run from
//! a tool callback) lands in the nested result and not in the caller's.

/// Suffix appended to output that hit the capture limit.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

#[derive(Debug, Clone, Default)]
struct OutputFrame {
    buffer: String,
    truncated: bool,
}

/// A stack of output buffers with a per-frame byte limit.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    frames: Vec<OutputFrame>,
    limit: usize,
}

impl CapturedOutput {
    /// Create a capture with the given per-frame limit in bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            frames: Vec::new(),
            limit,
        }
    }

    /// Open a new frame.
    pub fn begin(&mut self) {
        self.frames.push(OutputFrame::default());
    }

    /// Close the innermost frame and return what was written to it.
    pub fn finish(&mut self) -> String {
        match self.frames.pop() {
            Some(frame) if frame.truncated => frame.buffer + TRUNCATION_MARKER,
            Some(frame) => frame.buffer,
            None => String::new(),
        }
    }

    /// Append text to the innermost frame. Text written with no open frame is
    /// dropped.
    pub fn write(&mut self, text: &str) {
        let limit = self.limit;
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        if frame.truncated {
            return;
        }
        let room = limit.saturating_sub(frame.buffer.len());
        if text.len() <= room {
            frame.buffer.push_str(text);
            return;
        }
        let mut cut = room;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        frame.buffer.push_str(&text[..cut]);
        frame.truncated = true;
    }

    /// Append raw bytes, replacing invalid UTF-8.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write(&String::from_utf8_lossy(bytes));
    }

    /// Number of open frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Get the length of the innermost frame.
    pub fn len(&self) -> usize {
        self.frames.last().map_or(0, |frame| frame.buffer.len())
    }

    /// Check if the innermost frame is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CapturedOutput {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}
