//! Chunk-boundary-tolerant line framing

use thiserror::Error;

/// Maximum bytes buffered for a single incomplete frame (1 MiB)
pub const MAX_FRAME_BUFFER: usize = 1024 * 1024;

/// Fatal framing error - the stream cannot be resynchronized past this
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame buffer exceeded {limit} bytes without a complete frame")]
    BufferOverflow { limit: usize },
}

/// Reassembles complete JSON-line frames from arbitrary text chunks.
///
/// Frames come out in exactly the order their bytes were appended, no
/// matter how the transport split the chunks. A payload whose first line
/// opens a JSON object but does not close it is buffered across subsequent
/// lines until the accumulated text parses as JSON (the CLI pretty-prints
/// some payloads over multiple lines).
#[derive(Debug, Default)]
pub struct FrameReader {
    /// Trailing bytes of the current line, waiting for a newline
    partial: String,
    /// Accumulated lines of a multi-line JSON payload
    multiline: Option<String>,
    limit: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::with_limit(MAX_FRAME_BUFFER)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            partial: String::new(),
            multiline: None,
            limit,
        }
    }

    /// Append a chunk and collect every frame it completes.
    pub fn push(&mut self, chunk: &str) -> Result<Vec<String>, FrameError> {
        self.partial.push_str(chunk);

        let mut frames = Vec::new();
        while let Some(idx) = self.partial.find('\n') {
            let mut line: String = self.partial.drain(..=idx).collect();
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            self.accept_line(line, &mut frames)?;
        }

        if self.partial.len() > self.limit {
            self.partial.clear();
            return Err(FrameError::BufferOverflow { limit: self.limit });
        }

        Ok(frames)
    }

    /// Flush whatever is left at end-of-stream.
    ///
    /// A trailing line with no newline is treated as complete; an
    /// unfinished multi-line payload is surfaced raw so the classifier can
    /// report it as a parse failure instead of dropping it silently.
    pub fn finish(&mut self) -> Result<Vec<String>, FrameError> {
        let mut frames = Vec::new();
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.accept_line(line, &mut frames)?;
        }
        if let Some(pending) = self.multiline.take() {
            frames.push(pending);
        }
        Ok(frames)
    }

    /// Bytes currently buffered, across both the partial line and any
    /// multi-line accumulation.
    pub fn buffered(&self) -> usize {
        self.partial.len() + self.multiline.as_ref().map_or(0, String::len)
    }

    fn accept_line(&mut self, line: String, out: &mut Vec<String>) -> Result<(), FrameError> {
        if let Some(mut acc) = self.multiline.take() {
            acc.push('\n');
            acc.push_str(&line);
            if acc.len() > self.limit {
                return Err(FrameError::BufferOverflow { limit: self.limit });
            }
            if serde_json::from_str::<serde_json::Value>(&acc).is_ok() {
                out.push(acc);
            } else {
                self.multiline = Some(acc);
            }
            return Ok(());
        }

        if line.is_empty() {
            return Ok(());
        }

        // Opening marker without a parseable object starts a multi-line
        // accumulation; anything else is a complete frame as-is.
        if line.starts_with('{') && serde_json::from_str::<serde_json::Value>(&line).is_err() {
            if line.len() > self.limit {
                return Err(FrameError::BufferOverflow { limit: self.limit });
            }
            self.multiline = Some(line);
        } else {
            out.push(line);
        }
        Ok(())
    }
}
