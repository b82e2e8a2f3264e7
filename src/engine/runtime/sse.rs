//! Incremental decoder for runtime SSE responses
//!
//! Network chunks split lines arbitrarily, so bytes are buffered until a
//! full line is available. Only `data:` fields are of interest.

/// One decoded `data:` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SseData {
    Json(String),
    Done,
}

#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed raw bytes, returning every payload completed by them
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<SseData> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Payload left in the buffer when the body ended without a newline
    pub(crate) fn finish(&mut self) -> Option<SseData> {
        let line = std::mem::take(&mut self.buffer);
        parse_line(&line)
    }
}

fn parse_line(line: &[u8]) -> Option<SseData> {
    let line = String::from_utf8_lossy(line);
    let data = line.trim_end_matches(['\r', '\n']).strip_prefix("data:")?.trim();
    match data {
        "" => None,
        "[DONE]" => Some(SseData::Done),
        json => Some(SseData::Json(json.to_string())),
    }
}
