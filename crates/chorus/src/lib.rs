//! # Chorus
//!
//! A plugin host for WhatsApp-protocol chat automation.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌────────────┐    ┌───────────┐    ┌──────────────────────────────┐
//! │ ChatClient │───▶│ Event pump │───▶│ Dispatcher│───▶│ Plugin "economy" (own task)  │──▶ services
//! │  (events)  │    │ (per chat) │    │           │───▶│ Plugin "admin"   (own task)  │──▶ services
//! └────────────┘    └────────────┘    └───────────┘    └──────────────────────────────┘
//!                                           ▲
//!                         Scheduler ────────┘ (cron tasks, same deadlines)
//! ```
//!
//! - **Runtime**: configuration, logging, startup/shutdown, health endpoint
//! - **Event pump**: classifies raw events and keeps per-chat arrival order
//! - **Dispatcher**: mode gate, filters, command index, passive handlers
//! - **Plugins**: a [`Plugin`](prelude::Plugin) trait plus a declarative
//!   [`Manifest`](prelude::Manifest); instances come from plugin files
//! - **Services**: store gateway, wallet, rate limiter, permissions,
//!   scheduler and event bus, shared by every plugin
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use chorus::prelude::*;
//!
//! struct Ping;
//!
//! #[async_trait]
//! impl Plugin for Ping {
//!     fn manifest(&self) -> Manifest {
//!         Manifest::new("ping", "1.0.0").commands(["ping"]).cooldown(Duration::from_secs(3))
//!     }
//!
//!     async fn handle(&self, ctx: &PluginContext) -> HandlerResult {
//!         ctx.reply("pong").await?;
//!         Ok(())
//!     }
//! }
//!
//! static PING: PluginDescriptor = PluginDescriptor {
//!     api_version: CHORUS_PLUGIN_API_VERSION,
//!     kind: "ping",
//!     description: "Replies pong",
//!     create: || Arc::new(Ping),
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let _guard = init_logging(&config.logging);
//!     let host = Host::builder(config, client).plugin(&PING).start().await?;
//!     host.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `builtin-plugins`: the host-admin plugin (default)
//! - `toml-config` / `yaml-config`: configuration file formats
//! - `json-log`: JSON log output

pub use chorus_core as core;
pub use chorus_framework as framework;
pub use chorus_runtime as runtime;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use chorus::prelude::*;
/// ```
pub mod prelude {
    pub use std::sync::Arc;
    pub use std::time::Duration;

    // Runtime - main entry point
    pub use chorus_runtime::config::load_config;
    pub use chorus_runtime::logging::init_from_config as init_logging;
    pub use chorus_runtime::{ChorusConfig, Host};

    // Plugin system
    pub use chorus_framework::{
        BoxError, CHORUS_PLUGIN_API_VERSION, HandlerResult, Manifest, Overlap, Plugin,
        PluginContext, PluginDescriptor, TaskSpec, Trigger,
    };
    pub use chorus_framework::async_trait;

    // Shared services
    pub use chorus_framework::{Balance, Requirement, Role, WalletError};

    // Protocol types
    pub use chorus_core::{
        BoxedChatClient, ChatClient, Jid, MemoryChatClient, Message, OutboundPayload,
    };
}
