use crate::protocol::{DONE_SENTINEL, FRAME_PREFIX};

/// One complete line of interest from the response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedLine {
    /// Payload following `data: `
    Frame(String),
    /// `[DONE]` sentinel
    Done,
}

/// Incremental splitter for the newline-delimited response body.
///
/// Bytes are buffered until a newline arrives, so a multi-byte character or a
/// frame split across chunks is decoded only once it is complete.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline
    scanned: usize,
    finished: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the frames it completed. Nothing is returned after `Done`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedLine> {
        let mut lines = Vec::new();
        if self.finished {
            return lines;
        }
        self.buffer.extend_from_slice(chunk);

        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buffer[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            let line = String::from_utf8_lossy(&self.buffer[start..end]);
            start = end + 1;
            from = start;

            let line = line.strip_suffix('\r').unwrap_or(&line);
            let Some(payload) = line.strip_prefix(FRAME_PREFIX) else {
                continue;
            };
            if payload.trim() == DONE_SENTINEL {
                lines.push(DecodedLine::Done);
                self.finished = true;
                self.buffer.clear();
                self.scanned = 0;
                return lines;
            }
            lines.push(DecodedLine::Frame(payload.to_string()));
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        lines
    }

    /// Bytes of an incomplete trailing line
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
