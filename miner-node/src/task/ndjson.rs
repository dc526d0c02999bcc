//! Newline-delimited JSON framing over arbitrary chunk boundaries.

/// Accumulates chunks and yields complete lines (without the trailing
/// newline). Blank lines are dropped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                lines.push(line);
            }
        }
        lines
    }

    /// Remaining bytes of an unterminated last line, if any.
    pub fn finish(self) -> Option<Vec<u8>> {
        if self.pending.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(self.pending)
        }
    }
}
