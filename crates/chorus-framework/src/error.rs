//! Error types for the Chorus plugin host.

use std::path::PathBuf;

use thiserror::Error;

use chorus_core::{ClientError, StoreError};

use crate::permission::Requirement;

/// Boxed error returned by plugin handlers.
///
/// Plugins may use `?` on any error type that converts into it, including
/// `anyhow::Error` and plain strings.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for plugin handlers and lifecycle hooks.
pub type HandlerResult = Result<(), BoxError>;

// =============================================================================
// Permissions
// =============================================================================

/// Raised when a sender does not satisfy a requirement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PermissionError {
    /// Role too low, or a group-only check outside a group.
    #[error("not authorized: requires {required}")]
    NotAuthorized {
        /// The requirement that failed.
        required: Requirement,
    },
}

/// Result type for permission checks.
pub type PermissionResult<T> = Result<T, PermissionError>;

// =============================================================================
// Context
// =============================================================================

/// Errors raised by [`PluginContext`](crate::context::PluginContext) helpers.
#[derive(Error, Debug)]
pub enum ContextError {
    /// `reply` or `react` outside a message dispatch.
    #[error("no originating chat to reply to")]
    NoOriginChat,

    /// Host control is only available during message and task dispatch.
    #[error("host control is not available in this context")]
    NoHostControl,

    /// The plugin's config section has the wrong shape.
    #[error("invalid plugin config: {0}")]
    Config(#[from] serde_json::Error),

    /// The outbound call failed.
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Result type for context helpers.
pub type ContextResult<T> = Result<T, ContextError>;

// =============================================================================
// Wallet
// =============================================================================

/// Errors raised by the wallet service.
#[derive(Error, Debug, Clone)]
pub enum WalletError {
    /// Amounts must be at least 1.
    #[error("invalid amount {0}: must be at least 1")]
    InvalidAmount(i64),

    /// Sender and recipient are the same user.
    #[error("cannot transfer to yourself")]
    SelfTransfer,

    /// The debited balance is too small.
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds {
        /// Requested amount.
        needed: i64,
        /// Balance available.
        available: i64,
    },

    /// The credit would exceed the recipient's wallet limit.
    #[error("recipient wallet is full")]
    RecipientFull,

    /// The deposit would exceed the bank limit.
    #[error("bank is full")]
    BankFull,

    /// The withdrawal would exceed the wallet limit.
    #[error("wallet is full")]
    WalletFull,

    /// Optimistic concurrency retries were exhausted.
    #[error("too much contention on account {0}")]
    Contention(String),

    /// The debit leg of a transfer succeeded but the credit leg failed.
    #[error("transfer partially failed ({stage}): {source}")]
    PartialFailure {
        /// Where the transfer stopped.
        stage: &'static str,
        /// Whether the compensating credit was applied.
        compensated: bool,
        /// The failure that interrupted the transfer.
        source: StoreError,
    },

    /// A stored account could not be decoded.
    #[error("corrupt account record for {user}: {message}")]
    Corrupt {
        /// Account owner.
        user: String,
        /// Decode failure.
        message: String,
    },

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for wallet operations.
pub type WalletResult<T> = Result<T, WalletError>;

// =============================================================================
// Scheduler
// =============================================================================

/// Errors raised while registering scheduled tasks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The cron expression does not parse.
    #[error("invalid cron expression '{expr}' for task '{task}': {message}")]
    InvalidCron {
        /// Task id.
        task: String,
        /// Offending expression.
        expr: String,
        /// Parser message.
        message: String,
    },

    /// The timezone name is not in the tz database.
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    /// Two tasks of one plugin share a name.
    #[error("duplicate task '{task}' in plugin '{plugin}'")]
    DuplicateTask {
        /// Plugin name.
        plugin: String,
        /// Task name.
        task: String,
    },
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

// =============================================================================
// Registry
// =============================================================================

/// Errors raised by plugin discovery and registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The plugin directory does not exist.
    #[error("plugin directory not found: {0}")]
    DirectoryMissing(PathBuf),

    /// Reading the plugin directory failed.
    #[error("failed to read plugin directory: {0}")]
    Io(#[from] std::io::Error),

    /// A plugin file could not be parsed.
    #[error("invalid plugin file '{file}': {message}")]
    InvalidFile {
        /// File name.
        file: String,
        /// Parse failure.
        message: String,
    },

    /// A plugin file names a kind no descriptor provides.
    #[error("unknown plugin kind '{kind}' in '{file}'")]
    UnknownKind {
        /// File name.
        file: String,
        /// Requested kind.
        kind: String,
    },

    /// The manifest failed validation.
    #[error("invalid manifest for '{plugin}': {message}")]
    InvalidManifest {
        /// Plugin name.
        plugin: String,
        /// Validation failure.
        message: String,
    },

    /// The plugin name or one of its tokens is already taken.
    #[error("plugin '{plugin}' collides with '{existing}' on '{token}'")]
    Collision {
        /// Rejected plugin.
        plugin: String,
        /// Plugin already holding the token.
        existing: String,
        /// The contested name or command token.
        token: String,
    },

    /// No loaded plugin has this name.
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// The plugin is loaded but failed its init hook.
    #[error("plugin '{0}' failed to initialize and cannot be enabled")]
    Failed(String),

    /// Scheduled task registration failed.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl RegistryError {
    /// Creates an invalid manifest error.
    pub fn invalid_manifest(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidManifest {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
