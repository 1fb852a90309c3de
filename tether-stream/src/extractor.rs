//! Reassembles top-level JSON objects from arbitrarily chunked text.
//!
//! The scanner only understands enough JSON to find object boundaries: brace
//! depth, string literals and backslash escapes. Everything between objects is
//! treated as noise and dropped. Scan state survives across [`ObjectExtractor::feed`]
//! calls, so every byte is looked at once no matter how the input was split.

use crate::ansi::escape_len;

/// Default bound on buffered input that has not yet formed an object.
pub const DEFAULT_CEILING: usize = 1024 * 1024;

#[derive(Debug)]
pub struct ObjectExtractor {
    buffer: String,
    /// Next byte of `buffer` to scan.
    cursor: usize,
    /// Offset of the `{` opening the current object (valid while `depth > 0`).
    start: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
    ceiling: usize,
    discarded: usize,
}

impl Default for ObjectExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectExtractor {
    pub fn new() -> Self {
        Self::with_ceiling(DEFAULT_CEILING)
    }

    pub fn with_ceiling(ceiling: usize) -> Self {
        Self {
            buffer: String::new(),
            cursor: 0,
            start: 0,
            depth: 0,
            in_string: false,
            escaped: false,
            ceiling,
            discarded: 0,
        }
    }

    /// Append `chunk` and return every object it completed, in order.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);

        let mut objects = Vec::new();
        // Everything before `consumed` is finished with.
        let mut consumed = 0;
        let bytes = self.buffer.as_bytes();
        let mut i = self.cursor;

        while i < bytes.len() {
            let b = bytes[i];

            if self.depth == 0 {
                if b == b'{' {
                    match first_significant(&bytes[i + 1..]) {
                        // Can't tell yet whether this opens an object.
                        None => break,
                        Some(b'"' | b'}') => {
                            self.start = i;
                            self.depth = 1;
                            i += 1;
                            continue;
                        }
                        // `{` in prose, e.g. `fn main() {`
                        Some(_) => {}
                    }
                }
                i += 1;
                consumed = i;
                continue;
            }

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
            } else {
                match b {
                    b'"' => self.in_string = true,
                    b'{' => self.depth += 1,
                    b'}' => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            objects.push(self.buffer[self.start..=i].to_string());
                            consumed = i + 1;
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
        }

        self.buffer.drain(..consumed);
        self.cursor = i - consumed;
        if self.depth > 0 {
            self.start -= consumed;
        }

        if self.buffer.len() > self.ceiling {
            self.discarded += self.buffer.len();
            self.clear();
        }

        objects
    }

    /// Bytes dropped by the ceiling since the last call, if any.
    pub fn take_overflow(&mut self) -> Option<usize> {
        match std::mem::take(&mut self.discarded) {
            0 => None,
            n => Some(n),
        }
    }

    /// Bytes currently held waiting for an object to close.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all buffered input and scan state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
        self.start = 0;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }
}

/// First byte that is neither JSON whitespace nor part of a terminal escape
/// sequence. `None` if the input ends first.
fn first_significant(bytes: &[u8]) -> Option<u8> {
    let mut i = 0;
    while let Some(&b) = bytes.get(i) {
        match b {
            b' ' | b'\t' | b'\n' | b'\r' => i += 1,
            0x1b => i += escape_len(&bytes[i..])?,
            _ => return Some(b),
        }
    }
    None
}
