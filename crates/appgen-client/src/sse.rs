//! Incremental decoder for `text/event-stream` bodies.
//!
//! The browser-native SSE client cannot attach custom auth headers, so the
//! transport reads raw response bytes and this decoder reassembles frames
//! from them. Input arrives in arbitrary chunk sizes; frames are only
//! emitted once their terminating blank line has been seen.

/// One decoded SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name; `"message"` when the frame carried no `event:` field.
    pub event: String,
    /// Payload with multi-line `data:` fields joined by `\n`.
    pub data: String,
}

/// Stateful frame decoder fed with raw byte chunks.
///
/// Line endings are normalized while buffering: `\r\n` and bare `\r`
/// collapse to `\n`, so CRLF-emitting backends parse identically to
/// LF-only ones. An `\n` directly following a `\r` is swallowed even
/// when the pair is split across chunks.
#[derive(Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    skip_lf: bool,
}

impl SseDecoder {
    /// Appends a chunk and returns every frame completed by it.
    ///
    /// Partial trailing input stays buffered for the next call, so feeding
    /// a stream in any chunking produces the same frames as feeding it
    /// whole.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        for &byte in chunk {
            if std::mem::take(&mut self.skip_lf) && byte == b'\n' {
                continue;
            }
            if byte == b'\r' {
                self.buf.push(b'\n');
                self.skip_lf = true;
            } else {
                self.buf.push(byte);
            }
        }

        let mut frames = Vec::new();
        while let Some(idx) = find_blank_line(&self.buf) {
            let frame_bytes = self.buf[..idx].to_vec();
            self.buf.drain(..idx + 2);
            if let Some(frame) = parse_frame(&frame_bytes) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\n\n")
}

fn parse_frame(bytes: &[u8]) -> Option<SseFrame> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let mut event: Option<String> = None;
    let mut data_lines: Vec<String> = Vec::new();
    for line in text.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim_start().to_string());
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
        // Unknown field prefixes (id:, retry:, ...) are ignored.
    }
    let event = event.filter(|name| !name.is_empty());
    if event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data_lines.join("\n"),
    })
}
