//! Streaming response decoding

mod decoder;

use bytes::Bytes;
use futures::{Stream, StreamExt};

pub use decoder::{DecodeError, DecodeEvent, StreamDecoder, DEFAULT_MAX_LINE_BYTES};

use crate::error::ChatError;
use crate::providers::ProviderError;

/// Drive a fresh [`StreamDecoder`] from a transport byte stream.
///
/// The returned stream yields tokens in arrival order and always ends with
/// exactly one terminal event. A read error from the transport becomes a
/// `Failure`; reading stops after the first terminal event.
pub fn decode_stream<S>(
    byte_stream: S,
    max_line_bytes: usize,
) -> impl Stream<Item = DecodeEvent> + Send + 'static
where
    S: Stream<Item = Result<Bytes, ProviderError>> + Send + 'static,
{
    async_stream::stream! {
        let mut decoder = StreamDecoder::with_max_line_bytes(max_line_bytes);
        let mut byte_stream = std::pin::pin!(byte_stream);

        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(error = %e, "Stream read failed");
                    yield DecodeEvent::Failure { error: ChatError::Transport(e) };
                    return;
                }
            };

            for event in decoder.feed(&chunk) {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }
        }

        if let Some(event) = decoder.finish() {
            yield event;
        }
    }
}
