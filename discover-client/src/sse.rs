//! Incremental decoding of `text/event-stream` bodies.

use std::collections::VecDeque;
use futures::{Stream, StreamExt};
use shared::types::ServiceUpdate;
use crate::error::{ClientError, Result};

/// Splits a byte stream into the `data` payloads of SSE events.
///
/// Only the `data` field is interpreted; comments (keep-alives) and other
/// fields are skipped. Chunks may split lines, and lines may split UTF-8
/// sequences, at any byte.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    data: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning the payloads of every event it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut complete = Vec::new();

        for &byte in chunk {
            if byte != b'\n' {
                self.line.push(byte);
                continue;
            }

            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
            let line = std::mem::take(&mut self.line);

            if line.is_empty() {
                if let Some(data) = self.data.take() {
                    complete.push(data);
                }
                continue;
            }
            if line[0] == b':' {
                continue;
            }

            let line = String::from_utf8_lossy(&line);
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (&*line, ""),
            };
            if field == "data" {
                match &mut self.data {
                    Some(data) => {
                        data.push('\n');
                        data.push_str(value);
                    }
                    None => self.data = Some(value.to_string()),
                }
            }
        }

        complete
    }
}

struct DecodeState<S> {
    body: S,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    done: bool,
}

/// Turn an SSE response body into a stream of updates.
///
/// The stream ends when the body ends; a transport error is yielded once and
/// then the stream ends too.
pub fn decode_updates<S, B>(body: S) -> impl Stream<Item = Result<ServiceUpdate>>
where
    S: Stream<Item = std::result::Result<B, reqwest::Error>> + Unpin,
    B: AsRef<[u8]>,
{
    let state = DecodeState {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(data) = state.pending.pop_front() {
                let update =
                    serde_json::from_str::<ServiceUpdate>(&data).map_err(ClientError::from);
                return Some((update, state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => state.pending.extend(state.decoder.push(chunk.as_ref())),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(ClientError::Transport(e)), state));
                }
                None => state.done = true,
            }
        }
    })
}
