//! Buffered streaming decoder for newline-delimited JSON streams.
//!
//! Ollama streams one JSON object per line, but TCP chunk boundaries do not
//! respect lines. The decoder buffers partial lines until they complete.

use serde_json::Value;

/// Buffered decoder for newline-delimited JSON streams (NDJSON).
///
/// # Example
///
/// ```
/// use storybook_pipeline::StreamingDecoder;
///
/// let mut decoder = StreamingDecoder::new();
///
/// let values = decoder.decode(b"{\"message\":{\"content\":");
/// assert!(values.is_empty());
///
/// let values = decoder.decode(b"\"Hallo\"}}\n");
/// assert_eq!(values.len(), 1);
/// assert_eq!(values[0]["message"]["content"], "Hallo");
/// ```
pub struct StreamingDecoder {
    buffer: Vec<u8>,
}

impl StreamingDecoder {
    /// Create a new empty decoder.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed a raw chunk into the decoder and return any complete JSON lines.
    ///
    /// Lines that are not valid JSON are skipped. Bytes are buffered rather
    /// than decoded per chunk so multi-byte UTF-8 characters split across
    /// chunks survive.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);

        let mut values = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(val) = serde_json::from_str::<Value>(line) {
                values.push(val);
            }
        }

        values
    }

    /// Flush remaining buffer content, attempting to parse it as JSON.
    ///
    /// Call this after the stream ends to handle a trailing line that was
    /// not terminated by a newline.
    pub fn flush(&mut self) -> Option<Value> {
        let remaining = String::from_utf8_lossy(&self.buffer).trim().to_string();
        self.buffer.clear();
        if remaining.is_empty() {
            return None;
        }
        serde_json::from_str::<Value>(&remaining).ok()
    }
}

impl Default for StreamingDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_complete_lines() {
        let mut decoder = StreamingDecoder::new();
        let chunk = b"{\"message\":{\"content\":\"Es \"}}\n{\"message\":{\"content\":\"war\"}}\n";
        let values = decoder.decode(chunk);
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["message"]["content"], "Es ");
        assert_eq!(values[1]["message"]["content"], "war");
    }

    #[test]
    fn test_split_mid_value() {
        let mut decoder = StreamingDecoder::new();
        assert!(decoder.decode(b"{\"message\":{\"content\":\"ein").is_empty());
        assert!(decoder.decode(b"mal ").is_empty());
        let v = decoder.decode(b"\"}}\n");
        assert_eq!(v.len(), 1);
        assert_eq!(v[0]["message"]["content"], "einmal ");
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let mut decoder = StreamingDecoder::new();
        let line = "{\"message\":{\"content\":\"Füchse\"}}\n".as_bytes();
        // split inside the two-byte 'ü'
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;
        assert!(decoder.decode(&line[..split]).is_empty());
        let v = decoder.decode(&line[split..]);
        assert_eq!(v[0]["message"]["content"], "Füchse");
    }

    #[test]
    fn test_flush_remaining() {
        let mut decoder = StreamingDecoder::new();
        decoder.decode(b"{\"done\":true}");
        let flushed = decoder.flush();
        assert_eq!(flushed.unwrap()["done"], json!(true));
        assert!(decoder.flush().is_none());
    }

    #[test]
    fn test_non_json_lines_skipped() {
        let mut decoder = StreamingDecoder::new();
        let values = decoder.decode(b"not json\n{\"ok\":true}\n\n");
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["ok"], json!(true));
    }
}
