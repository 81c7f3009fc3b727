//! JSON Response Framer
//!
//! Notifications carry JSON with no length prefix and arbitrary
//! fragmentation. The framer tracks brace depth across calls and hands back
//! each complete top-level object as text.
//!
//! Scanning is done on bytes: `{` and `}` are ASCII and never occur inside a
//! multi-byte UTF-8 sequence, so a character split across two notifications
//! is reassembled intact.

use tracing::{debug, warn};

pub struct ResponseFramer {
    buffer: Vec<u8>,
    depth: usize,
    // Set once a capture outgrows the limit; the rest of that object is skipped
    discarding: bool,
    max_frame_len: usize,
}

impl ResponseFramer {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            depth: 0,
            discarding: false,
            max_frame_len,
        }
    }

    /// Consume a fragment and return every object it completed, in arrival order
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut complete = Vec::new();

        for &byte in bytes {
            if self.discarding {
                self.skip(byte);
                continue;
            }

            match byte {
                b'{' => {
                    if self.depth == 0 {
                        self.buffer.clear();
                    }
                    self.depth += 1;
                    self.buffer.push(byte);
                }
                b'}' if self.depth > 0 => {
                    self.depth -= 1;
                    self.buffer.push(byte);
                    if self.depth == 0 {
                        if let Some(text) = self.take_object() {
                            complete.push(text);
                        }
                    }
                }
                // Noise outside of an object, including stray closing braces
                _ if self.depth == 0 => {}
                _ => self.buffer.push(byte),
            }

            if self.buffer.len() > self.max_frame_len {
                warn!(
                    "Discarding capture: exceeds frame limit of {} bytes",
                    self.max_frame_len
                );
                self.buffer = Vec::new();
                self.discarding = true;
            }
        }

        if self.depth > 0 {
            debug!("Partial object buffered ({} bytes)", self.buffer.len());
        }

        complete
    }

    /// True while an object is partially assembled
    pub fn is_mid_object(&self) -> bool {
        self.depth > 0
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.depth = 0;
        self.discarding = false;
    }

    // Depth is still tracked so nested objects of the oversized one are not
    // mistaken for top-level messages.
    fn skip(&mut self, byte: u8) {
        match byte {
            b'{' => self.depth += 1,
            b'}' => {
                self.depth -= 1;
                if self.depth == 0 {
                    debug!("Oversized object skipped, resuming");
                    self.discarding = false;
                }
            }
            _ => {}
        }
    }

    // Only the captured span is dropped when it fails to parse; scanning
    // resumes at the next byte.
    fn take_object(&mut self) -> Option<String> {
        let bytes = std::mem::take(&mut self.buffer);
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                warn!("Discarding captured object with invalid UTF-8: {}", e);
                return None;
            }
        };

        match serde_json::from_str::<serde::de::IgnoredAny>(&text) {
            Ok(_) => Some(text),
            Err(e) => {
                warn!("Discarding malformed JSON ({}): {}", e, text);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::settings::DEFAULT_MAX_FRAME_LEN;
    use proptest::prelude::*;

    const SEGMENT: &str = r#"{"id":1,"name":"S1","startLed":0,"endLed":9,"effect":"Fire","brightness":128,"parameters":{"speed":3,"nested":{"a":true}}}"#;

    fn framer() -> ResponseFramer {
        ResponseFramer::new(DEFAULT_MAX_FRAME_LEN)
    }

    fn feed_in_chunks(text: &str, size: usize) -> Vec<String> {
        let mut f = framer();
        text.as_bytes()
            .chunks(size)
            .flat_map(|chunk| f.feed(chunk))
            .collect()
    }

    #[test]
    fn test_reassembles_across_chunk_sizes() {
        for size in [1, 3, 20] {
            assert_eq!(feed_in_chunks(SEGMENT, size), vec![SEGMENT.to_string()]);
        }
    }

    #[test]
    fn test_multiple_objects_in_one_feed() {
        let mut f = framer();
        let out = f.feed(br#"{"a":1}{"b":{"c":2}}{"d":"#);
        assert_eq!(out, vec![r#"{"a":1}"#, r#"{"b":{"c":2}}"#]);
        assert!(f.is_mid_object());
        assert_eq!(f.feed(b"3}"), vec![r#"{"d":3}"#]);
        assert_eq!(f.depth(), 0);
    }

    #[test]
    fn test_leading_noise_is_discarded() {
        let mut f = framer();
        let out = f.feed(b"\x00\xA0garbage}}{\"ok\":true}trailing");
        assert_eq!(out, vec![r#"{"ok":true}"#]);
        assert!(!f.is_mid_object());
    }

    #[test]
    fn test_malformed_object_does_not_block_next() {
        let mut f = framer();
        let input = r#"{"segments":[{bad json}]}{"id":1,"startLed":0,"endLed":5}"#;
        let out = f.feed(input.as_bytes());
        assert_eq!(out, vec![r#"{"id":1,"startLed":0,"endLed":5}"#]);
    }

    #[test]
    fn test_split_multibyte_character() {
        let text = r#"{"name":"Bühne"}"#;
        let bytes = text.as_bytes();
        let split = text.find('ü').unwrap() + 1;
        let mut f = framer();
        assert!(f.feed(&bytes[..split]).is_empty());
        assert_eq!(f.feed(&bytes[split..]), vec![text.to_string()]);
    }

    #[test]
    fn test_oversized_capture_is_dropped() {
        let mut f = ResponseFramer::new(16);
        assert!(f.feed(br#"{"name":"this is far too long"#).is_empty());
        assert!(f.is_mid_object());
        assert!(f.feed(b"\"}").is_empty());
        assert!(!f.is_mid_object());
        assert_eq!(f.feed(br#"{"a":1}"#), vec![r#"{"a":1}"#]);
    }

    #[test]
    fn test_oversized_capture_hides_nested_objects() {
        let mut f = ResponseFramer::new(64);
        let inner = r#"{"id":7,"startLed":0,"endLed":9}"#;
        let text = format!(r#"{{"segments":[{},{},{}],"available_effects":[]}}"#, inner, inner, inner);
        let out: Vec<String> = text
            .as_bytes()
            .chunks(20)
            .flat_map(|chunk| f.feed(chunk))
            .collect();
        assert!(out.is_empty());
        assert_eq!(f.depth(), 0);
        assert_eq!(f.feed(inner.as_bytes()), vec![inner.to_string()]);
    }

    #[test]
    fn test_reset_drops_partial_object() {
        let mut f = framer();
        f.feed(br#"{"a":{"b":"#);
        f.reset();
        assert_eq!(f.feed(br#"{"c":1}"#), vec![r#"{"c":1}"#]);
    }

    proptest! {
        #[test]
        fn prop_any_chunking_yields_one_object(
            values in proptest::collection::vec(0i64..1000, 0..20),
            size in 1usize..32,
        ) {
            let text = serde_json::json!({"values": values, "inner": {"n": values.len()}}).to_string();
            prop_assert_eq!(feed_in_chunks(&text, size), vec![text.clone()]);
        }
    }
}
