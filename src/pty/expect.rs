//! Accumulating buffer for exact-substring expectations.

/// Console output received since the last successful match.
///
/// Matching is literal: a hit consumes everything up to and including
/// the matched text, so the next expectation only sees newer output.
#[derive(Debug, Default)]
pub struct ExpectBuffer {
    data: Vec<u8>,
    eof: bool,
    /// Offset below which the current needle is known not to start.
    scan_from: usize,
    needle: Vec<u8>,
}

impl ExpectBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn mark_eof(&mut self) {
        self.eof = true;
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Unconsumed output.
    pub fn pending(&self) -> &[u8] {
        &self.data
    }

    /// Drop unconsumed output, keeping the end-of-stream flag.
    pub fn clear(&mut self) {
        self.data.clear();
        self.scan_from = 0;
        self.needle.clear();
    }

    /// Look for `needle` in the unconsumed output and consume through
    /// the end of the first occurrence.
    pub fn take_match(&mut self, needle: &[u8]) -> bool {
        if needle.is_empty() {
            return true;
        }
        if self.needle != needle {
            self.needle = needle.to_vec();
            self.scan_from = 0;
        }

        let haystack = &self.data[self.scan_from..];
        match haystack.windows(needle.len()).position(|w| w == needle) {
            Some(pos) => {
                let end = self.scan_from + pos + needle.len();
                self.data.drain(..end);
                self.scan_from = 0;
                self.needle.clear();
                true
            }
            None => {
                // A match may still straddle the tail and the next chunk.
                self.scan_from = self.data.len().saturating_sub(needle.len() - 1);
                false
            }
        }
    }
}
