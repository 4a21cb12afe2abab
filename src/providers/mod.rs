//! Upstream chat API transport

mod openai_compat;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::config::ApiKey;

pub use openai_compat::OpenAiCompatTransport;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Request failed: {status} {body}")]
    Status { status: u16, body: String },

    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
}

/// Raw response body chunks, in arrival order
pub type ByteStream = BoxStream<'static, Result<Bytes, ProviderError>>;

/// Opens one streaming chat completion.
///
/// Implementations return only after the upstream accepted the request with
/// a 2xx status; anything else is a [`ProviderError`].
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open_stream(&self, api_key: &ApiKey, prompt: &str) -> Result<ByteStream, ProviderError>;
}
