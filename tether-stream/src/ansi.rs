//! ANSI escape sequence removal.

use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

/// CSI sequences, OSC sequences (BEL or ST terminated), charset selection,
/// other two-byte escapes, then any stray ESC.
static ANSI: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-9;?]*[A-Za-z]",
        r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
        r"|\x1b[()][A-Z0-9]",
        r"|\x1b[=>MNOP78]",
        r"|\x1b",
    ))
    .ok()
});

/// Remove terminal escape sequences from `text`.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    match ANSI.as_ref() {
        Some(re) => re.replace_all(text, ""),
        None => Cow::Borrowed(text),
    }
}

/// Length of the escape sequence at the start of `bytes` (which begins with
/// ESC), or `None` if more input is needed to see its end.
pub(crate) fn escape_len(bytes: &[u8]) -> Option<usize> {
    match *bytes.get(1)? {
        // CSI: parameters, then a final byte in 0x40..=0x7e
        b'[' => bytes[2..]
            .iter()
            .position(|b| (0x40..=0x7e).contains(b))
            .map(|p| p + 3),
        // OSC: BEL or ST terminated
        b']' => {
            for (i, &b) in bytes.iter().enumerate().skip(2) {
                match b {
                    0x07 => return Some(i + 1),
                    0x1b => {
                        return match bytes.get(i + 1) {
                            Some(b'\\') => Some(i + 2),
                            Some(_) => Some(i),
                            None => None,
                        };
                    }
                    _ => {}
                }
            }
            None
        }
        b'(' | b')' => bytes.get(2).map(|_| 3),
        b'=' | b'>' | b'M' | b'N' | b'O' | b'P' | b'7' | b'8' => Some(2),
        _ => Some(1),
    }
}
