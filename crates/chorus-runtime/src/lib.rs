//! Chorus Runtime - process layer for the Chorus chat automation host.
//!
//! This crate provides:
//! - Layered configuration (`chorus.toml`, profiles, environment) with validation
//! - Logging setup over `tracing-subscriber`
//! - The lifecycle supervisor ([`Host`]): ordered startup, signals, shutdown
//! - The per-chat event pump between the chat client and the dispatcher
//! - The health endpoint (`GET /health`, `GET /plugins`)
//!
//! ```rust,ignore
//! use chorus_runtime::{Host, config::load_config, logging};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let _guard = logging::init_from_config(&config.logging);
//!
//!     let host = Host::builder(config, client).start().await?;
//!     host.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod pump;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use config::{ChorusConfig, ConfigError, ConfigLoader, ConfigResult, Profile};
pub use error::{RuntimeError, RuntimeResult};
pub use health::HealthState;
pub use logging::{LoggingBuilder, init_from_config};
pub use pump::EventPump;
pub use supervisor::{Host, HostBuilder};

// Re-export tracing for use by plugin crates
pub use tracing;
pub use tracing_subscriber;

/// Prelude module for convenient imports.
///
/// This provides all the commonly used logging macros:
/// - `trace!`, `debug!`, `info!`, `warn!`, `error!`
/// - `span`, `event`
/// - `instrument` attribute
/// - `Level` for span creation
pub mod prelude {
    pub use tracing::{Level, debug, error, event, info, instrument, span, trace, warn};
}
