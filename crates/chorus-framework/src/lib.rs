//! # Chorus Framework
//!
//! The plugin host for chat automation.
//!
//! This layer provides:
//! - Shared services: a resilient collections gateway, the per-user wallet,
//!   cooldowns and rate limits, permission checks, the event bus
//! - A cron scheduler with overlap policies and per-task timeouts
//! - The event classifier turning raw protocol events into messages
//! - The plugin registry with hot reload, and the dispatcher routing each
//!   message to every interested handler under a deadline
//! - A built-in host-admin plugin (with the `builtin-plugins` feature)
//!
//! The framework is independent of process concerns; configuration, logging
//! and the lifecycle live in `chorus-runtime`.

pub mod bus;
pub mod classifier;
pub mod context;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod host;
pub mod outbound;
pub mod permission;
pub mod plugin;
pub mod rate_limit;
pub mod registry;
pub mod scheduler;
pub mod wallet;

#[cfg(feature = "builtin-plugins")]
pub mod builtin;

pub use bus::{BusMessage, EventBus};
pub use classifier::{Classified, Classifier, HostEvent, ParticipantAction};
pub use context::{HostServices, HostSettings, Mode, Origin, PluginContext};
pub use directory::ChatDirectory;
pub use dispatcher::{
    Admission, DispatchConfig, Dispatcher, HandlerOutcome, SpamPolicy, Templates,
};
pub use error::{
    BoxError, ContextError, ContextResult, HandlerResult, PermissionError, PermissionResult,
    RegistryError, RegistryResult, SchedulerError, SchedulerResult, WalletError, WalletResult,
};
pub use gateway::{BreakerState, CollectionsGateway, GatewayConfig, IndexDecl};
pub use host::{BroadcastReport, HostControl, HostHandle};
pub use outbound::OutboundGate;
pub use permission::{PermissionResolver, Requirement, Role};
pub use plugin::{
    BoxedPlugin, CHORUS_PLUGIN_API_VERSION, DirectorySource, InlineSource, Manifest,
    ManifestOverrides, Plugin, PluginCatalog, PluginDescriptor, PluginFile, PluginSource,
    Trigger,
};
pub use rate_limit::RateLimiter;
pub use registry::{PluginRegistry, PluginReport, PluginStats, RegistrySnapshot, ReloadReport};
pub use scheduler::{HostClock, Overlap, Scheduler, TaskExecutor, TaskId, TaskReport, TaskSpec};
pub use wallet::{Balance, TransactionKind, TransferReceipt, UserAccount, Wallet, WalletConfig};

// Plugin crates implement `Plugin` with this attribute.
pub use async_trait::async_trait;
