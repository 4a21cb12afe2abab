//! Incremental decoder for chat-completion server-sent events
//!
//! The upstream sends UTF-8 lines of the form:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"He"}}]}
//!
//! data: {"choices":[{"delta":{"content":"llo"}}]}
//!
//! data: [DONE]
//! ```
//!
//! Chunks may end anywhere, including inside a line or inside a multi-byte
//! character. The decoder keeps the unterminated tail as raw bytes and only
//! turns complete lines into text; a `\n` byte never occurs inside a UTF-8
//! sequence, so the split is safe at the byte level.

use std::borrow::Cow;

use serde_json::Value;
use thiserror::Error;

use crate::error::ChatError;

/// End-of-stream marker line
pub const DONE_SENTINEL: &str = "data: [DONE]";

/// Default bound on a partial line carried between chunks (1 MiB)
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

const DATA_PREFIX: &str = "data:";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Something the decoder wants the caller to apply
#[derive(Debug)]
pub enum DecodeEvent {
    /// A new, non-empty text delta
    Token { text: String },

    /// The stream ended; `final_text` is the concatenation of every token
    Complete { final_text: String },

    /// The turn cannot continue
    Failure { error: ChatError },
}

impl DecodeEvent {
    /// Terminal events end the turn. Nothing follows them.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DecodeEvent::Token { .. })
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Stream line exceeded {limit} bytes without a newline")]
    LineTooLong { limit: usize },
}

#[derive(Debug, Default)]
struct StreamState {
    /// Bytes of the trailing line that has not seen its `\n` yet
    carryover: Vec<u8>,
    /// Every token emitted so far, in order
    accumulated: String,
}

/// Single-use decoder for one streamed response.
///
/// Feed it chunks as they arrive and call [`StreamDecoder::finish`] when the
/// transport reports end-of-stream. After a terminal event it ignores all
/// further input.
#[derive(Debug)]
pub struct StreamDecoder {
    state: StreamState,
    max_line_bytes: usize,
    /// No byte has been decided yet; a leading BOM may still be arriving
    at_start: bool,
    terminated: bool,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            state: StreamState::default(),
            max_line_bytes,
            at_start: true,
            terminated: false,
        }
    }

    /// Consume one transport chunk and return the events it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        if self.terminated {
            return events;
        }

        let chunk = match self.skip_bom(chunk) {
            Some(chunk) => chunk,
            None => return events,
        };

        let mut rest: &[u8] = &chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            let line: Cow<'_, [u8]> = if self.state.carryover.is_empty() {
                Cow::Borrowed(head)
            } else {
                self.state.carryover.extend_from_slice(head);
                Cow::Owned(std::mem::take(&mut self.state.carryover))
            };

            if let Some(event) = self.process_line(&line) {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    self.terminate();
                    return events;
                }
            }
        }

        self.state.carryover.extend_from_slice(rest);
        if self.state.carryover.len() > self.max_line_bytes {
            tracing::warn!(
                buffered = self.state.carryover.len(),
                limit = self.max_line_bytes,
                "Event line exceeded buffer limit"
            );
            self.terminate();
            events.push(DecodeEvent::Failure {
                error: DecodeError::LineTooLong {
                    limit: self.max_line_bytes,
                }
                .into(),
            });
        }

        events
    }

    /// Signal end-of-stream without a sentinel.
    ///
    /// An abrupt close counts as success: the accumulated text is the final
    /// text. Returns `None` when the decoder already terminated.
    pub fn finish(mut self) -> Option<DecodeEvent> {
        if self.terminated {
            return None;
        }
        if !self.state.carryover.is_empty() {
            tracing::debug!(
                bytes = self.state.carryover.len(),
                "Discarding unterminated trailing line"
            );
        }
        self.terminate();
        Some(DecodeEvent::Complete {
            final_text: std::mem::take(&mut self.state.accumulated),
        })
    }

    /// Drop a UTF-8 byte-order mark at the very start of the stream.
    ///
    /// While undecided, the BOM prefix seen so far waits in `carryover`.
    /// Returns `None` when the bytes so far could still be a split BOM.
    fn skip_bom<'a>(&mut self, chunk: &'a [u8]) -> Option<Cow<'a, [u8]>> {
        if !self.at_start {
            return Some(Cow::Borrowed(chunk));
        }

        let mut head = std::mem::take(&mut self.state.carryover);
        head.extend_from_slice(chunk);
        if head.len() < UTF8_BOM.len() && UTF8_BOM.starts_with(&head) {
            self.state.carryover = head;
            return None;
        }

        self.at_start = false;
        if head.starts_with(UTF8_BOM) {
            head.drain(..UTF8_BOM.len());
        }
        Some(Cow::Owned(head))
    }

    fn terminate(&mut self) {
        self.terminated = true;
        self.state.carryover = Vec::new();
    }

    fn process_line(&mut self, raw: &[u8]) -> Option<DecodeEvent> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim();

        if line.is_empty() {
            return None;
        }

        if line == DONE_SENTINEL {
            return Some(DecodeEvent::Complete {
                final_text: std::mem::take(&mut self.state.accumulated),
            });
        }

        // Comments and keep-alives
        let data = line.strip_prefix(DATA_PREFIX)?.trim_start();

        let payload: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping malformed event line");
                return None;
            }
        };

        let delta = payload
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())?;

        self.state.accumulated.push_str(delta);
        Some(DecodeEvent::Token {
            text: delta.to_string(),
        })
    }
}
