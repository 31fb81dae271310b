use bytes::Bytes;

/// Incremental SSE decoder specialized for the usage passthrough: only
/// `data:` payloads matter, so events come out as their concatenated
/// data strings. The forwarded bytes travel separately; this side keeps
/// its own raw buffer so a multi-byte UTF-8 character split across chunk
/// boundaries is held back until its remaining bytes arrive.
#[derive(Debug, Default)]
pub struct SseParser {
    raw: Vec<u8>,
    pending: String,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the data payloads of every event the
    /// chunk completed. Bytes that do not yet form a complete UTF-8
    /// sequence are retained for the next call.
    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<String> {
        self.raw.extend_from_slice(chunk);
        let decoded = self.drain_decoded();
        self.push_str(&decoded)
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut payloads = Vec::new();

        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');

            if line.is_empty() {
                self.flush_event(&mut payloads);
            } else {
                self.consume_field(line);
            }
        }

        payloads
    }

    /// End of stream: behave as if the upstream had closed with a final
    /// blank line so a trailing partial event is not lost.
    pub fn finish(&mut self) -> Vec<String> {
        if !self.raw.is_empty() {
            let tail = std::mem::take(&mut self.raw);
            self.pending.push_str(&String::from_utf8_lossy(&tail));
        }
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.consume_field(line.trim_end_matches('\r'));
        }
        let mut payloads = Vec::new();
        self.flush_event(&mut payloads);
        payloads
    }

    /// Decode the longest valid UTF-8 prefix of the raw buffer. An
    /// incomplete trailing sequence stays buffered; invalid bytes in the
    /// middle become replacement characters so the line structure
    /// survives.
    fn drain_decoded(&mut self) -> String {
        let mut decoded = String::new();
        let mut rest = std::mem::take(&mut self.raw);

        loop {
            match std::str::from_utf8(&rest) {
                Ok(text) => {
                    decoded.push_str(text);
                    rest.clear();
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    decoded.push_str(
                        std::str::from_utf8(&rest[..valid]).unwrap_or_default(),
                    );
                    match err.error_len() {
                        None => {
                            // Split multi-byte character; wait for the
                            // rest of it.
                            rest.drain(..valid);
                            break;
                        }
                        Some(skip) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            rest.drain(..valid + skip);
                        }
                    }
                }
            }
        }

        self.raw = rest;
        decoded
    }

    fn consume_field(&mut self, line: &str) {
        // Comments, `event:`, `id:` and `retry:` fields are all ignored;
        // extractors key off the JSON payload itself.
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
        } else if line == "data" {
            self.data_lines.push(String::new());
        }
    }

    fn flush_event(&mut self, payloads: &mut Vec<String>) {
        if self.data_lines.is_empty() {
            return;
        }
        payloads.push(self.data_lines.join("\n"));
        self.data_lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(parser: &mut SseParser, bytes: &[u8]) -> Vec<String> {
        parser.push_bytes(&Bytes::copy_from_slice(bytes))
    }

    #[test]
    fn folds_consecutive_data_lines_into_one_payload() {
        let mut parser = SseParser::new();
        let payloads = parser.push_str("data: {\"a\":\ndata: 1}\n\n");
        assert_eq!(payloads, vec!["{\"a\":\n1}".to_string()]);
    }

    #[test]
    fn tolerates_crlf_line_endings() {
        let mut parser = SseParser::new();
        let payloads = parser.push_str("event: message_start\r\ndata: {}\r\n\r\n");
        assert_eq!(payloads, vec!["{}".to_string()]);
    }

    #[test]
    fn reassembles_events_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: {\"x\":").is_empty());
        assert!(parser.push_str("2}").is_empty());
        assert_eq!(parser.push_str("\n\n"), vec!["{\"x\":2}".to_string()]);
    }

    #[test]
    fn multibyte_character_split_across_chunks_survives() {
        // "é" is 0xC3 0xA9; split it between two chunks.
        let mut parser = SseParser::new();
        assert!(push(&mut parser, b"data: {\"text\":\"caf\xc3").is_empty());
        let payloads = push(&mut parser, b"\xa9\"}\n\n");
        assert_eq!(payloads, vec!["{\"text\":\"café\"}".to_string()]);
    }

    #[test]
    fn incomplete_tail_is_not_flushed_early() {
        let mut parser = SseParser::new();
        // A lone lead byte must neither emit nor be dropped.
        assert!(push(&mut parser, b"data: \xe2\x82").is_empty());
        let payloads = push(&mut parser, b"\xac\n\n");
        assert_eq!(payloads, vec!["€".to_string()]);
    }

    #[test]
    fn truly_invalid_bytes_become_replacement_characters() {
        let mut parser = SseParser::new();
        let payloads = push(&mut parser, b"data: a\xffb\n\n");
        assert_eq!(payloads, vec!["a\u{fffd}b".to_string()]);
    }

    #[test]
    fn finish_flushes_a_trailing_partial_event() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        assert_eq!(parser.finish(), vec!["tail".to_string()]);
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn finish_recovers_a_buffered_incomplete_sequence() {
        let mut parser = SseParser::new();
        assert!(push(&mut parser, b"data: caf\xc3").is_empty());
        // The stream dies mid-character: the payload still surfaces,
        // lossily decoded.
        let payloads = parser.finish();
        assert_eq!(payloads, vec!["caf\u{fffd}".to_string()]);
    }

    #[test]
    fn comments_and_event_fields_are_skipped() {
        let mut parser = SseParser::new();
        let payloads = parser.push_str(": keep-alive\n\nevent: ping\ndata: x\n\n");
        assert_eq!(payloads, vec!["x".to_string()]);
    }

    #[test]
    fn event_without_data_yields_nothing() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("event: ping\n\n").is_empty());
    }
}
