//! Incremental decoder for `text/event-stream` bodies.

/// Buffers raw body chunks and yields the joined `data:` payload of every
/// complete event block. Blocks without data (comments, keep-alives) are
/// skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(payload) = self.next_block() {
            if let Some(payload) = payload {
                payloads.push(payload);
            }
        }
        payloads
    }

    fn next_block(&mut self) -> Option<Option<String>> {
        let lf = self
            .buffer
            .windows(2)
            .position(|window| window == b"\n\n")
            .map(|idx| (idx, 2));
        let crlf = self
            .buffer
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map(|idx| (idx, 4));
        let (idx, delimiter_len) = match (lf, crlf) {
            (Some(lf), Some(crlf)) => {
                if crlf.0 < lf.0 {
                    crlf
                } else {
                    lf
                }
            }
            (Some(found), None) | (None, Some(found)) => found,
            (None, None) => return None,
        };

        let block = self.buffer.drain(..idx + delimiter_len).collect::<Vec<_>>();
        let text = String::from_utf8_lossy(&block);
        let data = text
            .lines()
            .filter_map(|line| {
                line.strip_prefix("data: ")
                    .or_else(|| line.strip_prefix("data:"))
            })
            .collect::<Vec<_>>()
            .join("\n");

        if data.is_empty() {
            Some(None)
        } else {
            Some(Some(data))
        }
    }
}
