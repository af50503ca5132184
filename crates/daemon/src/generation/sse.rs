// Incremental decoder for upstream SSE completion streams.
//
// Bytes are buffered until a newline; each complete line is decoded on its
// own so a multi-byte character split across reads is never mangled.

use serde_json::Value;

const DATA_PREFIX: &str = "data: ";
const DONE_MARKER: &str = "[DONE]";

/// Which JSON shape carries the delta text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// Completions: `choices[0].text`, or a top-level `content`.
    Plain,
    /// Chat completions: `choices[0].delta.content`.
    Chat,
}

/// Result of interpreting a single trimmed line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseLine {
    pub content: Option<String>,
    pub done: bool,
}

/// Item produced by [`SseDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Delta(String),
    Done,
}

/// Interpret one SSE line. Non-data lines and malformed JSON yield an empty
/// result rather than an error.
pub fn parse_line(line: &str, shape: ResponseShape) -> SseLine {
    let Some(data) = line.strip_prefix(DATA_PREFIX) else {
        return SseLine::default();
    };
    if data.trim() == DONE_MARKER {
        return SseLine { content: None, done: true };
    }

    let Ok(value) = serde_json::from_str::<Value>(data) else {
        tracing::debug!(line = %data, "skipping malformed SSE data line");
        return SseLine::default();
    };

    let content = match shape {
        ResponseShape::Chat => Some(
            value
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        ResponseShape::Plain => match value.get("choices").and_then(Value::as_array) {
            Some(choices) if !choices.is_empty() => Some(
                choices[0].get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
            ),
            _ => Some(value.get("content").and_then(Value::as_str).unwrap_or_default().to_string()),
        },
    };

    SseLine { content, done: false }
}

/// Line-buffering SSE decoder. Feed it raw reads with [`push`](Self::push).
#[derive(Debug)]
pub struct SseDecoder {
    shape: ResponseShape,
    buffer: Vec<u8>,
    finished: bool,
}

impl SseDecoder {
    pub fn new(shape: ResponseShape) -> Self {
        Self { shape, buffer: Vec::new(), finished: false }
    }

    /// True once a `[DONE]` marker has been seen. Later input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Append a chunk and return every item completed by it, in order.
    /// Empty deltas are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamItem> {
        let mut items = Vec::new();
        if self.finished {
            return items;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if self.handle_line(&line, &mut items) {
                self.buffer.clear();
                break;
            }
        }
        items
    }

    /// Flush a trailing line that arrived without a newline at end of stream.
    pub fn finish(&mut self) -> Vec<StreamItem> {
        let mut items = Vec::new();
        if self.finished || self.buffer.is_empty() {
            return items;
        }
        let line = std::mem::take(&mut self.buffer);
        self.handle_line(&line, &mut items);
        items
    }

    /// Returns true when the line was the done marker.
    fn handle_line(&mut self, raw: &[u8], items: &mut Vec<StreamItem>) -> bool {
        let decoded = String::from_utf8_lossy(raw);
        let parsed = parse_line(decoded.trim(), self.shape);
        if parsed.done {
            self.finished = true;
            items.push(StreamItem::Done);
            return true;
        }
        if let Some(content) = parsed.content.filter(|c| !c.is_empty()) {
            items.push(StreamItem::Delta(content));
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CHAT_HI: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n";

    fn deltas(items: &[StreamItem]) -> String {
        items
            .iter()
            .filter_map(|item| match item {
                StreamItem::Delta(text) => Some(text.as_str()),
                StreamItem::Done => None,
            })
            .collect()
    }

    // ── parse_line ─────────────────────────────────────────────────

    #[test]
    fn chat_delta_is_extracted() {
        let parsed = parse_line(CHAT_HI.trim(), ResponseShape::Chat);
        assert_eq!(parsed, SseLine { content: Some("hi".into()), done: false });
    }

    #[test]
    fn done_marker_has_no_content() {
        let parsed = parse_line("data: [DONE]", ResponseShape::Chat);
        assert_eq!(parsed, SseLine { content: None, done: true });
    }

    #[test]
    fn chat_delta_without_content_is_empty_string() {
        let parsed = parse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#, ResponseShape::Chat);
        assert_eq!(parsed.content.as_deref(), Some(""));
    }

    #[test]
    fn plain_shape_prefers_choice_text_then_content() {
        let parsed = parse_line(r#"data: {"choices":[{"text":"abc"}]}"#, ResponseShape::Plain);
        assert_eq!(parsed.content.as_deref(), Some("abc"));

        let parsed = parse_line(r#"data: {"content":"llama"}"#, ResponseShape::Plain);
        assert_eq!(parsed.content.as_deref(), Some("llama"));

        let parsed = parse_line(r#"data: {"choices":[],"content":"fallback"}"#, ResponseShape::Plain);
        assert_eq!(parsed.content.as_deref(), Some("fallback"));
    }

    #[test]
    fn malformed_json_and_non_data_lines_are_skipped() {
        assert_eq!(parse_line("data: {not json", ResponseShape::Plain), SseLine::default());
        assert_eq!(parse_line(": keep-alive", ResponseShape::Plain), SseLine::default());
        assert_eq!(parse_line("event: message", ResponseShape::Chat), SseLine::default());
    }

    // ── SseDecoder ─────────────────────────────────────────────────

    #[test]
    fn line_split_across_chunks_yields_one_delta() {
        let mut decoder = SseDecoder::new(ResponseShape::Chat);
        let (left, right) = CHAT_HI.as_bytes().split_at(17);

        assert!(decoder.push(left).is_empty());
        assert_eq!(decoder.push(right), vec![StreamItem::Delta("hi".into())]);
    }

    #[test]
    fn multiple_lines_in_one_read_are_ordered() {
        let mut decoder = SseDecoder::new(ResponseShape::Plain);
        let chunk = concat!(
            "data: {\"choices\":[{\"text\":\"a\"}]}\n\n",
            ": ping\n",
            "data: {\"choices\":[{\"text\":\"b\"}]}\r\n",
            "data: [DONE]\n",
            "data: {\"choices\":[{\"text\":\"ignored\"}]}\n",
        );

        let items = decoder.push(chunk.as_bytes());
        assert_eq!(
            items,
            vec![StreamItem::Delta("a".into()), StreamItem::Delta("b".into()), StreamItem::Done]
        );
        assert!(decoder.is_finished());
        assert!(decoder.push(b"data: {\"content\":\"late\"}\n").is_empty());
    }

    #[test]
    fn empty_deltas_are_dropped() {
        let mut decoder = SseDecoder::new(ResponseShape::Chat);
        let items = decoder.push(b"data: {\"choices\":[{\"delta\":{}}]}\n");
        assert!(items.is_empty());
    }

    #[test]
    fn multibyte_character_split_across_reads_survives() {
        let mut decoder = SseDecoder::new(ResponseShape::Plain);
        let line = "data: {\"content\":\"caf\u{e9} \u{2026}\"}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;

        assert!(decoder.push(&line[..split]).is_empty());
        assert_eq!(decoder.push(&line[split..]), vec![StreamItem::Delta("caf\u{e9} \u{2026}".into())]);
    }

    #[test]
    fn finish_flushes_unterminated_trailing_line() {
        let mut decoder = SseDecoder::new(ResponseShape::Plain);
        assert!(decoder.push(b"data: {\"content\":\"tail\"}").is_empty());
        assert_eq!(decoder.finish(), vec![StreamItem::Delta("tail".into())]);
        assert!(decoder.finish().is_empty());
    }

    proptest! {
        #[test]
        fn arbitrary_chunk_split_reassembles_stream(split in 0usize..200) {
            let stream = concat!(
                "data: {\"choices\":[{\"delta\":{\"content\":\"The \"}}]}\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"quiet \u{2019}harbor\u{2019}\"}}]}\n",
                "data: [DONE]\n",
            )
            .as_bytes();
            let split = split.min(stream.len());

            let mut decoder = SseDecoder::new(ResponseShape::Chat);
            let mut items = decoder.push(&stream[..split]);
            items.extend(decoder.push(&stream[split..]));

            prop_assert_eq!(deltas(&items), "The quiet \u{2019}harbor\u{2019}");
            prop_assert_eq!(items.last(), Some(&StreamItem::Done));
        }

        #[test]
        fn byte_at_a_time_matches_single_read(text in "[a-zA-Z0-9 \u{e9}\u{4e16}]{0,40}") {
            let line = format!("data: {}\n", serde_json::json!({ "content": text }));

            let mut whole = SseDecoder::new(ResponseShape::Plain);
            let expected = whole.push(line.as_bytes());

            let mut bytewise = SseDecoder::new(ResponseShape::Plain);
            let mut items = Vec::new();
            for byte in line.as_bytes() {
                items.extend(bytewise.push(std::slice::from_ref(byte)));
            }
            prop_assert_eq!(items, expected);
        }
    }
}
