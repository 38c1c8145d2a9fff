//! SSE (Server-Sent Events) parser for the runner's wire stream.

use std::collections::VecDeque;

use futures::Stream;
use tokio_stream::StreamExt;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental parser: feed raw bytes with [`SseParser::push`], drain
/// complete events with [`SseParser::next_event`].
#[derive(Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    ready: VecDeque<SseEvent>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        while let Some(newline_pos) = self.buffer.find('\n') {
            let line = self.buffer[..newline_pos]
                .trim_end_matches('\r')
                .to_string();
            self.buffer.drain(..=newline_pos);
            self.handle_line(&line);
        }
    }

    fn handle_line(&mut self, line: &str) {
        if line.is_empty() {
            // Empty line = dispatch event
            self.dispatch();
            return;
        }
        if line.starts_with(':') {
            // Comment, skip
            return;
        }

        if let Some(value) = line.strip_prefix("event:") {
            self.event = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            self.id = Some(value.trim_start().to_string());
        }
        // Ignore unknown fields
    }

    fn dispatch(&mut self) {
        if self.data.is_empty() {
            return;
        }
        self.ready.push_back(SseEvent {
            event: self.event.take(),
            data: self.data.join("\n"),
            id: self.id.take(),
        });
        self.data.clear();
    }

    pub fn next_event(&mut self) -> Option<SseEvent> {
        self.ready.pop_front()
    }

    /// Flush a trailing event that was never terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        self.dispatch();
        self.ready.pop_front()
    }
}

/// Parse a reqwest response body as an SSE event stream.
pub fn sse_stream(response: reqwest::Response) -> impl Stream<Item = anyhow::Result<SseEvent>> {
    struct State {
        bytes: std::pin::Pin<
            Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>,
        >,
        parser: SseParser,
        exhausted: bool,
    }

    futures::stream::unfold(
        State {
            bytes: Box::pin(response.bytes_stream()),
            parser: SseParser::new(),
            exhausted: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.parser.next_event() {
                    return Some((Ok(event), state));
                }
                if state.exhausted {
                    return state.parser.finish().map(|event| (Ok(event), state));
                }
                match state.bytes.next().await {
                    Some(Ok(chunk)) => state.parser.push(&chunk),
                    Some(Err(e)) => {
                        return Some((Err(anyhow::anyhow!("SSE stream error: {e}")), state));
                    }
                    None => state.exhausted = true,
                }
            }
        },
    )
}
