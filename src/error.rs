//! Turn failure taxonomy

use thiserror::Error;

use crate::config::ConfigError;
use crate::providers::ProviderError;
use crate::stream::DecodeError;

/// Everything that can end a turn through the failure path.
///
/// The `Display` output is what the user sees in the assistant message, so
/// every variant forwards to the underlying error's message.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] ProviderError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}
