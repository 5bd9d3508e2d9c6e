//! Distills a filter's (possibly chunked) stderr into a single reply line.

const CAPACITY: usize = 256;
const DEFAULT_REASON: &str = "Content Rejected";

/// Bounded accumulator holding the most recent meaningful line of a filter's
/// stderr, per [`RejectBuffer::append`].
#[derive(Debug, Default)]
pub struct RejectBuffer {
    buf: Vec<u8>,
}

impl RejectBuffer {
    pub fn new() -> RejectBuffer {
        RejectBuffer { buf: Vec::new() }
    }

    /// Feeds one chunk of raw stderr output into the buffer.
    pub fn append(&mut self, chunk: &[u8]) {
        let trimmed_end = rtrim_end(chunk);
        let had_trailing_newline = chunk[trimmed_end..].contains(&b'\n');
        let chunk = &chunk[..trimmed_end];
        if chunk.is_empty() {
            return;
        }

        let (line, had_embedded_newline) = match chunk.iter().rposition(|&b| b == b'\n') {
            Some(i) => (&chunk[i + 1..], true),
            None => (chunk, false),
        };

        if had_embedded_newline || self.buf.last() == Some(&b'\n') {
            self.buf.clear();
        }

        let line = &line[ltrim_start(line)..];
        let room = CAPACITY.saturating_sub(self.buf.len());
        self.buf.extend_from_slice(&line[..line.len().min(room)]);

        if had_trailing_newline && self.buf.len() < CAPACITY {
            self.buf.push(b'\n');
        }
    }

    /// Consumes the buffer, producing the final single-line reject reason.
    ///
    /// Empty (or all-whitespace) input always finalizes to the literal
    /// `"Content Rejected"` — this is the filter's diagnostic, not the
    /// configured policy-reject line, and the two must never be conflated.
    pub fn finalize(mut self) -> String {
        let end = rtrim_end(&self.buf);
        self.buf.truncate(end);
        if self.buf.is_empty() {
            DEFAULT_REASON.to_owned()
        } else {
            String::from_utf8_lossy(&self.buf).into_owned()
        }
    }
}

fn rtrim_end(s: &[u8]) -> usize {
    s.iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(0)
}

fn ltrim_start(s: &[u8]) -> usize {
    s.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(s.len())
}
