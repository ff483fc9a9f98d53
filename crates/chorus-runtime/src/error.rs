//! Runtime error types.

use std::io;

use thiserror::Error;

use chorus_core::{ClientError, StoreError};
use chorus_framework::{RegistryError, WalletError};

pub use crate::config::{ConfigError, ConfigResult};

/// Errors that stop the host from starting or shutting down cleanly.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Invalid or unreadable configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The document store could not be opened or reached.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The wallet could not prepare its collections.
    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),

    /// Plugin discovery or loading failed.
    #[error("plugin error: {0}")]
    Registry(#[from] RegistryError),

    /// The chat client failed.
    #[error("chat client error: {0}")]
    Client(#[from] ClientError),

    /// The health endpoint could not bind.
    #[error("health endpoint error: {0}")]
    Health(#[source] io::Error),

    /// `start` was called twice.
    #[error("host is already running")]
    AlreadyRunning,
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
