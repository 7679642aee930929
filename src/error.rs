use std::io;
use thiserror::Error;

use crate::config::ConfigError;
use crate::vhost::ListenEndpoint;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: ListenEndpoint,
        source: io::Error,
    },

    #[error("event poll failed: {0}")]
    Poll(io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
