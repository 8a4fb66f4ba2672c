use thiserror::Error;

use crate::client::ClientError;
use crate::config::ConfigError;
use crate::core::StateError;
use crate::daemon::{CacheError, IpcError};

/// Crate-level convenience error.
///
/// A thin wrapper over the per-module errors; callers that care about the
/// specific failure match on the inner variant.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
