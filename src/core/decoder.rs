//! Tail-buffering line reassembler for `data: <json>\n` frames.
//!
//! The response body arrives in chunks that do not respect line boundaries.
//! Bytes are appended to a buffer; complete lines are lifted out and the
//! trailing fragment stays buffered until a newline or the end of the stream.

pub const EVENT_PREFIX: &str = "data: ";

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Bytes of `buf` already known to contain no newline.
    scanned: usize,
    /// Length of the last cumulative snapshot handed to [`FrameDecoder::feed`].
    seen: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts the whole response text received so far and returns the
    /// payloads of lines completed since the previous call.
    pub fn feed(&mut self, cumulative: &str) -> Vec<String> {
        let bytes = cumulative.as_bytes();
        if bytes.len() < self.seen {
            tracing::warn!(seen = self.seen, len = bytes.len(), "cumulative text shrank, ignoring snapshot");
            return Vec::new();
        }
        let fresh = &bytes[self.seen..];
        self.seen = bytes.len();
        self.push(fresh)
    }

    /// Appends a delta of the response body.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        let mut consumed = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buf[from..].iter().position(|&b| b == b'\n') {
            let end = from + offset;
            if let Some(payload) = payload_of(&self.buf[consumed..end]) {
                payloads.push(payload);
            }
            consumed = end + 1;
            from = consumed;
        }

        self.buf.drain(..consumed);
        self.scanned = self.buf.len();
        payloads
    }

    /// Examines the unterminated tail once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.buf);
        self.scanned = 0;
        payload_of(&tail)
    }
}

fn payload_of(line: &[u8]) -> Option<String> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let payload = line.strip_prefix(EVENT_PREFIX.as_bytes())?;
    Some(String::from_utf8_lossy(payload).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const STREAM: &str = concat!(
        "data: {\"type\": \"total_pages\", \"total\": 2}\n\n",
        ": keep-alive\n",
        "data: {\"type\": \"page_start\", \"page\": 1, \"total\": 2}\n\n",
        "event: ignored\n",
        "data: {\"type\": \"page_complete\", \"page\": 1, \"total\": 2}\n\n",
        "data: {\"type\": \"complete\", \"message\": \"Processing complete \u{2713}\"}\n\n",
    );

    fn whole() -> Vec<String> {
        FrameDecoder::new().push(STREAM.as_bytes())
    }

    #[test]
    fn lifts_only_prefixed_lines() {
        let payloads = whole();
        assert_eq!(payloads.len(), 4);
        assert!(payloads.iter().all(|p| p.starts_with('{')));
    }

    #[test]
    fn every_split_point_yields_the_same_payloads() {
        let bytes = STREAM.as_bytes();
        for cut in 0..=bytes.len() {
            let mut dec = FrameDecoder::new();
            let mut got = dec.push(&bytes[..cut]);
            got.extend(dec.push(&bytes[cut..]));
            assert_eq!(got, whole(), "split at {cut}");
            assert_eq!(dec.finish(), None);
        }
    }

    #[test]
    fn byte_at_a_time_matches_single_push() {
        let mut dec = FrameDecoder::new();
        let got: Vec<String> = STREAM.as_bytes().iter().flat_map(|b| dec.push(std::slice::from_ref(b))).collect();
        assert_eq!(got, whole());
    }

    #[test]
    fn split_json_is_held_until_the_newline_arrives() {
        let mut dec = FrameDecoder::new();
        assert!(dec.push(b"data: {\"type\":\"page_st").is_empty());
        let got = dec.push(b"art\",\"page\":3,\"total\":9}\n");
        assert_eq!(got, vec!["{\"type\":\"page_start\",\"page\":3,\"total\":9}".to_string()]);
    }

    #[test]
    fn cumulative_snapshots_are_diffed() {
        let mut dec = FrameDecoder::new();
        let mut text = String::new();
        let mut got = Vec::new();
        for piece in STREAM.split_inclusive('}') {
            text.push_str(piece);
            got.extend(dec.feed(&text));
        }
        assert_eq!(got, whole());
        assert!(dec.feed(&text).is_empty());
        assert!(dec.feed("data: ").is_empty());
    }

    #[test]
    fn crlf_lines_and_unterminated_tail() {
        let mut dec = FrameDecoder::new();
        assert_eq!(dec.push(b"data: {\"a\":1}\r\ndata: {\"type\":\"complete\"}"), vec!["{\"a\":1}".to_string()]);
        assert_eq!(dec.finish().as_deref(), Some("{\"type\":\"complete\"}"));
        assert_eq!(dec.finish(), None);
    }

    #[test]
    fn non_event_tail_is_dropped_at_finish() {
        let mut dec = FrameDecoder::new();
        assert!(dec.push(b"retry: 100").is_empty());
        assert_eq!(dec.finish(), None);
    }
}
