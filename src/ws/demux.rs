use serde_json::Value;
use tracing::warn;

/// Classification of a single binary frame.
#[derive(Debug)]
pub enum Demuxed {
    /// The accumulated buffer parsed as a complete JSON value.
    Json(Value),
    /// Not valid UTF-8: an Opus packet.
    Audio(Vec<u8>),
    /// Valid UTF-8 but not yet a complete JSON value; held for reassembly.
    Partial,
}

/// Separates the two payload kinds the wire multiplexes onto binary frames:
/// JSON control messages (possibly fragmented across frames) and Opus audio.
///
/// The test is "valid UTF-8 AND parses as JSON", not UTF-8 alone: an Opus
/// packet is very unlikely to be valid UTF-8 and even less likely to parse,
/// while a JSON fragment is always valid UTF-8.
pub struct FrameDemux {
    json_buffer: Vec<u8>,
}

impl FrameDemux {
    pub fn new() -> Self {
        Self {
            json_buffer: Vec::new(),
        }
    }

    pub fn on_binary(&mut self, frame: Vec<u8>) -> Demuxed {
        if std::str::from_utf8(&frame).is_ok() {
            self.json_buffer.extend_from_slice(&frame);
            match serde_json::from_slice::<Value>(&self.json_buffer) {
                Ok(value) => {
                    self.json_buffer.clear();
                    Demuxed::Json(value)
                }
                Err(_) => Demuxed::Partial,
            }
        } else {
            if !self.json_buffer.is_empty() {
                warn!(
                    "discarding {} buffered bytes of incomplete JSON",
                    self.json_buffer.len()
                );
                self.json_buffer.clear();
            }
            Demuxed::Audio(frame)
        }
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.json_buffer.len()
    }
}

impl Default for FrameDemux {
    fn default() -> Self {
        Self::new()
    }
}
