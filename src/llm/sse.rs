//! Server-sent events framing for streamed completions

use crate::llm::{DeltaStream, ProviderError};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use std::collections::VecDeque;

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if any
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
}

/// Incremental SSE parser
///
/// Bytes are buffered until a full line is available, so chunk boundaries may
/// fall anywhere, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let text: &str = &text;
            let line = text.strip_suffix('\r').unwrap_or(text);
            if let Some(event) = self.handle_line(line) {
                events.push(event);
            }
        }

        events
    }

    /// Flush a trailing event not terminated by a blank line
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            if let Some(event) = self.handle_line(line.trim_end_matches('\r')) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn handle_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// What a provider makes of one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseAction {
    Delta(String),
    Skip,
    Done,
}

struct DeltaState<F> {
    bytes: BoxStream<'static, Result<Vec<u8>, ProviderError>>,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
    extract: F,
    eof: bool,
    finished: bool,
}

/// Turn a byte stream of SSE frames into text deltas using `extract`
///
/// The stream ends at [`SseAction::Done`], at end of body, or after the first error.
pub fn delta_stream<S, F>(bytes: S, extract: F) -> DeltaStream
where
    S: Stream<Item = Result<Vec<u8>, ProviderError>> + Send + 'static,
    F: Fn(&SseEvent) -> Result<SseAction, ProviderError> + Send + 'static,
{
    let state = DeltaState {
        bytes: bytes.boxed(),
        parser: SseParser::new(),
        pending: VecDeque::new(),
        extract,
        eof: false,
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return None;
            }

            if let Some(event) = st.pending.pop_front() {
                match (st.extract)(&event) {
                    Ok(SseAction::Delta(text)) => return Some((Ok(text), st)),
                    Ok(SseAction::Skip) => continue,
                    Ok(SseAction::Done) => return None,
                    Err(e) => {
                        st.finished = true;
                        return Some((Err(e), st));
                    }
                }
            }

            if st.eof {
                return None;
            }

            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = st.parser.push(&chunk);
                    st.pending.extend(events);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(e), st));
                }
                None => {
                    st.eof = true;
                    if let Some(event) = st.parser.finish() {
                        st.pending.push_back(event);
                    }
                }
            }
        }
    })
    .boxed()
}
