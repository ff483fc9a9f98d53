//! Built-in plugins shipped with the Chorus host.
//!
//! Enabled by the `builtin-plugins` feature flag (on by default).
//!
//! | Plugin | Kind | Description |
//! |--------|------|-------------|
//! | [`ADMIN_PLUGIN`] | `"admin"` | Host-admin commands: reload, enable, disable, stats, broadcast |
//!
//! # Loading built-in plugins
//!
//! ```rust,ignore
//! let catalog = PluginCatalog::new().with(&ADMIN_PLUGIN);
//! ```
//!
//! and a plugin file selecting it:
//!
//! ```toml
//! kind = "admin"
//! ```

pub mod admin;

pub use admin::ADMIN_PLUGIN;

use crate::plugin::PluginDescriptor;

/// Every built-in descriptor.
pub fn descriptors() -> [&'static PluginDescriptor; 1] {
    [&ADMIN_PLUGIN]
}
