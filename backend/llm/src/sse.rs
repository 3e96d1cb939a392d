//! # SSE decoding
//!
//! Turns the chunked body of a streaming chat completion into text deltas.
//! - Bytes are buffered and split on `\n` (a trailing `\r` is dropped)
//! - Only `data: ` lines matter; everything else is skipped
//! - `data: [DONE]` ends the stream successfully
//! - Frames that are not valid JSON, or carry no content, are skipped
//! - A body that ends without `[DONE]` also ends successfully

use std::collections::VecDeque;
use std::fmt::Display;

use bytes::BytesMut;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, trace};

use kapi_core::{ChunkStream, UpstreamError};

/// Longest line accepted before the body is treated as malformed.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

const DATA_PREFIX: &str = "data: ";
const DONE_MARKER: &str = "[DONE]";

/// Classification of one line of the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Delta(String),
    Done,
    Skip,
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Classify a single line (without its line terminator).
pub fn parse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix(DATA_PREFIX) else {
        return SseLine::Skip;
    };
    if data == DONE_MARKER {
        return SseLine::Done;
    }

    match serde_json::from_str::<CompletionChunk>(data) {
        Ok(chunk) => match chunk.choices.into_iter().next() {
            Some(ChunkChoice {
                delta: ChunkDelta {
                    content: Some(content),
                },
            }) if !content.is_empty() => SseLine::Delta(content),
            _ => SseLine::Skip,
        },
        Err(e) => {
            trace!(error = %e, "Skipping unparseable stream frame");
            SseLine::Skip
        }
    }
}

struct DecodeState<S> {
    body: S,
    buffer: BytesMut,
    pending: VecDeque<String>,
    finished: bool,
}

impl<S> DecodeState<S> {
    /// Pull every complete line out of the buffer.
    fn drain_lines(&mut self) {
        while !self.finished {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                break;
            };
            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(line.len() - 1);
            self.absorb(&line);
        }
    }

    fn absorb(&mut self, raw: &[u8]) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        match parse_line(&line) {
            SseLine::Delta(text) => self.pending.push_back(text),
            SseLine::Done => {
                debug!("Upstream stream completed");
                self.finished = true;
            }
            SseLine::Skip => {}
        }
    }
}

/// Decode a streaming completion body into a stream of text deltas.
///
/// A transport error from `body` ends the stream with
/// [`UpstreamError::Transport`]; an oversized line ends it with
/// [`UpstreamError::Decode`]. Nothing is yielded after an error.
pub fn delta_stream<S, B, E>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: Display,
{
    let state = DecodeState {
        body: Box::pin(body),
        buffer: BytesMut::with_capacity(8192),
        pending: VecDeque::new(),
        finished: false,
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(delta) = state.pending.pop_front() {
                return Some((Ok(delta), state));
            }
            if state.finished {
                return None;
            }

            match state.body.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(chunk.as_ref());
                    state.drain_lines();
                    if !state.finished && state.buffer.len() > MAX_LINE_BYTES {
                        state.finished = true;
                        state.pending.clear();
                        let err = UpstreamError::Decode(format!(
                            "stream line exceeds {MAX_LINE_BYTES} bytes"
                        ));
                        return Some((Err(err), state));
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.pending.clear();
                    return Some((Err(UpstreamError::Transport(e.to_string())), state));
                }
                None => {
                    if !state.buffer.is_empty() {
                        let rest = state.buffer.split();
                        state.absorb(&rest);
                    }
                    state.finished = true;
                }
            }
        }
    });

    Box::pin(stream)
}
