//! Plugin system for the Chorus host.
//!
//! # Architecture
//!
//! A plugin is a type implementing [`Plugin`]: a declarative [`Manifest`]
//! (commands, flags, scheduled tasks, passive triggers) plus async hooks.
//! Compiled-in plugins are published as static [`PluginDescriptor`]s and
//! collected into a [`PluginCatalog`]. Plugin files discovered through a
//! [`PluginSource`] pick a kind from the catalog, optionally rename it,
//! adjust its manifest and supply its config section.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use chorus::prelude::*;
//!
//! struct Ping;
//!
//! #[async_trait]
//! impl Plugin for Ping {
//!     fn manifest(&self) -> Manifest {
//!         Manifest::new("ping", "1.0.0").commands(["ping"])
//!     }
//!
//!     async fn handle(&self, ctx: &PluginContext) -> HandlerResult {
//!         ctx.reply("pong").await?;
//!         Ok(())
//!     }
//! }
//!
//! pub static PING: PluginDescriptor = PluginDescriptor {
//!     api_version: CHORUS_PLUGIN_API_VERSION,
//!     kind: "ping",
//!     description: "Replies pong",
//!     create: || Arc::new(Ping),
//! };
//! ```
//!
//! # Hooks
//!
//! - [`Plugin::handle`] runs for commands routed to the plugin and, when the
//!   manifest is `passive`, for matching non-command messages.
//! - [`Plugin::on_task`] runs for each scheduled task tick.
//! - [`Plugin::on_init`] runs once per load, before any other hook.
//! - [`Plugin::on_unload`] runs when the plugin is removed or the host stops.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::PluginContext;
use crate::error::HandlerResult;

// ─── Submodules ──────────────────────────────────────────────────────────────
pub mod descriptor;
pub mod manifest;
pub mod source;

// ─── Re-exports from submodules ──────────────────────────────────────────────
pub use descriptor::{CHORUS_PLUGIN_API_VERSION, PluginCatalog, PluginDescriptor};
pub use manifest::{Manifest, ManifestOverrides, TaskOverride, Trigger};
pub use source::{DirectorySource, InlineSource, PluginFile, PluginSource, parse_plugin_file};

// ─── Plugin ──────────────────────────────────────────────────────────────────

/// A feature module.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// The plugin's own manifest. Plugin files may override parts of it.
    fn manifest(&self) -> Manifest;

    /// Handles a command or passive message.
    async fn handle(&self, ctx: &PluginContext) -> HandlerResult;

    /// Runs once after load. A failure leaves the plugin disabled.
    async fn on_init(&self, _ctx: &PluginContext) -> HandlerResult {
        Ok(())
    }

    /// Runs a scheduled task declared in the manifest.
    async fn on_task(&self, task: &str, _ctx: &PluginContext) -> HandlerResult {
        Err(format!("no handler for scheduled task '{task}'").into())
    }

    /// Runs when the plugin is unloaded.
    async fn on_unload(&self) {}
}

/// Type alias for a shared plugin instance.
pub type BoxedPlugin = Arc<dyn Plugin>;
