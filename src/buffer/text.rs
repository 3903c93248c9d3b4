//! Text rendering of a ring buffer's contents.
//!
//! The ring stores raw bytes; nothing guarantees a snapshot starts on a UTF-8
//! boundary once older bytes have been evicted. `Display` therefore renders
//! lossily, while [`RingBuffer::to_text`] surfaces the decoding error.

use super::RingBuffer;
use regex::Regex;
use std::borrow::Cow;
use std::fmt;
use std::string::FromUtf8Error;
use std::sync::OnceLock;

fn ansi_regex() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        Regex::new(r"\x1B\[([0-9]{1,2}(;[0-9]{1,2})?)?[m|K]|\x1B\[[0-9]+[A-Za-z]")
            .expect("ANSI pattern is valid")
    })
}

/// Removes colour and cursor-movement escape sequences.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ansi_regex().replace_all(text, "")
}

impl RingBuffer {
    pub fn to_text(&self) -> Result<String, FromUtf8Error> {
        String::from_utf8(self.snapshot().into_owned())
    }

    pub fn to_text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.snapshot()).into_owned()
    }
}

impl fmt::Display for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.snapshot()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_renders_snapshot() {
        let mut rb = RingBuffer::new(11).unwrap();
        rb.write(b"hello world,hello,golang");
        assert_eq!(rb.to_string(), "ello,golang");
    }

    #[test]
    fn test_to_text_rejects_split_codepoint() {
        let mut rb = RingBuffer::new(3).unwrap();
        // "é" is two bytes; the ring keeps only its second byte.
        rb.write("aé!!".as_bytes());
        assert!(rb.to_text().is_err());
        assert_eq!(rb.to_text_lossy(), "\u{FFFD}!!");
    }

    #[test]
    fn test_to_text_valid() {
        let mut rb = RingBuffer::new(16).unwrap();
        rb.write("héllo".as_bytes());
        assert_eq!(rb.to_text().unwrap(), "héllo");
    }

    #[test]
    fn test_strip_ansi() {
        let colored = "\x1b[31merror\x1b[0m: \x1b[1;32mok\x1b[0m\x1b[2K";
        assert_eq!(strip_ansi(colored), "error: ok");
        assert!(matches!(strip_ansi("plain"), Cow::Borrowed("plain")));
    }
}
