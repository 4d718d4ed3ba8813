use crate::error::OllamaApiError;
use crate::events::ChatChunk;

/// Incremental parser for newline-delimited JSON streams.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences split across network chunks are decoded intact.
#[derive(Debug, Default)]
pub struct NdjsonStreamParser {
    buffer: Vec<u8>,
}

impl NdjsonStreamParser {
    /// Feed arbitrary bytes into the parser and drain complete lines.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<ChatChunk, OllamaApiError>> {
        self.buffer.extend_from_slice(bytes);
        let mut chunks = Vec::new();

        while let Some(split) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=split).collect();
            if let Some(chunk) = parse_line(&line) {
                chunks.push(chunk);
            }
        }

        chunks
    }

    /// Parse whatever remains once the body ends without a trailing newline.
    pub fn finish(&mut self) -> Option<Result<ChatChunk, OllamaApiError>> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }

    /// Parse a complete body in one shot.
    pub fn parse_all(input: &str) -> Vec<Result<ChatChunk, OllamaApiError>> {
        let mut parser = Self::default();
        let mut chunks = parser.feed(input.as_bytes());
        chunks.extend(parser.finish());
        chunks
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }
}

fn parse_line(line: &[u8]) -> Option<Result<ChatChunk, OllamaApiError>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    Some(
        serde_json::from_str::<ChatChunk>(text)
            .map_err(|error| OllamaApiError::MalformedChunk(format!("{error}: {text}"))),
    )
}

#[cfg(test)]
mod tests {
    use super::NdjsonStreamParser;

    #[test]
    fn lines_split_across_feeds_are_reassembled() {
        let mut parser = NdjsonStreamParser::default();

        let first = parser.feed(br#"{"model":"m","message":{"role":"assistant","content":"Hel"#);
        assert!(first.is_empty());
        assert!(!parser.is_empty_buffer());

        let second = parser.feed(b"lo\"},\"done\":false}\n");
        assert_eq!(second.len(), 1);
        let chunk = second[0].as_ref().expect("chunk should parse");
        assert_eq!(chunk.content(), "Hello");
        assert!(parser.is_empty_buffer());
    }

    #[test]
    fn split_utf8_sequence_survives() {
        let line = "{\"message\":{\"role\":\"assistant\",\"content\":\"caf\u{e9}\"},\"done\":false}\n";
        let bytes = line.as_bytes();
        let cut = line.find('\u{e9}').expect("accent present") + 1;

        let mut parser = NdjsonStreamParser::default();
        assert!(parser.feed(&bytes[..cut]).is_empty());
        let chunks = parser.feed(&bytes[cut..]);
        assert_eq!(
            chunks[0].as_ref().expect("chunk should parse").content(),
            "caf\u{e9}"
        );
    }
}
