//! Configuration for the Chorus host.
//!
//! Layered loading (defaults, files, environment) with figment, followed by
//! validation of everything the host cannot start without.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    AntiSpamConfig, ChorusConfig, DispatchSection, HealthConfig, HostConfig, LogFormat, LogLevel,
    LogOutput, LoggingConfig, RateLimitConfig, SchedulerConfig, SpanEventConfig, StoreConfig,
    WalletSection,
};
pub use validation::{ValidatedHost, validate_config};
