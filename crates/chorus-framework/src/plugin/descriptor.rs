//! Plugin descriptors: the static, `Copy` handle to a compiled-in plugin.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::BoxedPlugin;

// ─── API versioning ──────────────────────────────────────────────────────────

/// Current Chorus plugin API version (1.0).
pub const CHORUS_PLUGIN_API_VERSION: u32 = 0x0001_0000;

// ─── PluginDescriptor ────────────────────────────────────────────────────────

/// A static descriptor naming a plugin kind and how to instantiate it.
///
/// Plugin crates publish one as a `static`; the host collects them into a
/// [`PluginCatalog`] and plugin files refer to them by `kind`.
///
/// ```rust,ignore
/// pub static ECONOMY: PluginDescriptor = PluginDescriptor {
///     api_version: CHORUS_PLUGIN_API_VERSION,
///     kind: "economy",
///     description: "Wallet commands",
///     create: || Arc::new(Economy),
/// };
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PluginDescriptor {
    /// Plugin API version this descriptor was compiled against.
    pub api_version: u32,

    /// Kind name referenced by plugin files.
    pub kind: &'static str,

    /// Short description for listings.
    pub description: &'static str,

    /// Factory creating a fresh instance.
    pub create: fn() -> BoxedPlugin,
}

impl PluginDescriptor {
    /// Returns `true` if this descriptor's API version is compatible with the
    /// running host.
    ///
    /// The major part must match exactly; the descriptor's minor part must be
    /// ≤ the host's minor part.
    pub fn is_compatible(&self) -> bool {
        let host_major = CHORUS_PLUGIN_API_VERSION >> 16;
        let desc_major = self.api_version >> 16;
        let desc_minor = self.api_version & 0xFFFF;
        let host_minor = CHORUS_PLUGIN_API_VERSION & 0xFFFF;
        desc_major == host_major && desc_minor <= host_minor
    }

    /// Creates a live instance.
    #[inline]
    pub fn instantiate(&self) -> BoxedPlugin {
        (self.create)()
    }
}

// ─── PluginCatalog ───────────────────────────────────────────────────────────

/// The compiled-in plugin kinds available to plugin files.
#[derive(Debug, Clone, Default)]
pub struct PluginCatalog {
    kinds: BTreeMap<&'static str, PluginDescriptor>,
}

impl PluginCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a descriptor. Incompatible descriptors are skipped with a warning;
    /// a later descriptor of the same kind replaces the earlier one.
    pub fn register(&mut self, descriptor: &PluginDescriptor) -> &mut Self {
        if !descriptor.is_compatible() {
            warn!(
                kind = descriptor.kind,
                api_version = format_args!("{:#010x}", descriptor.api_version),
                "Plugin API version incompatible, skipping"
            );
            return self;
        }
        debug!(kind = descriptor.kind, "Plugin kind registered");
        self.kinds.insert(descriptor.kind, *descriptor);
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, descriptor: &PluginDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    /// Instantiates a plugin of `kind`.
    pub fn create(&self, kind: &str) -> Option<BoxedPlugin> {
        self.kinds.get(kind).map(PluginDescriptor::instantiate)
    }

    /// Returns `true` when `kind` is known.
    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Known kinds with their descriptions.
    pub fn kinds(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.kinds.values().map(|d| (d.kind, d.description))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::context::PluginContext;
    use crate::error::HandlerResult;
    use crate::plugin::{Manifest, Plugin};

    struct Nop;

    #[async_trait]
    impl Plugin for Nop {
        fn manifest(&self) -> Manifest {
            Manifest::new("nop", "1.0.0")
        }

        async fn handle(&self, _ctx: &PluginContext) -> HandlerResult {
            Ok(())
        }
    }

    static NOP: PluginDescriptor = PluginDescriptor {
        api_version: CHORUS_PLUGIN_API_VERSION,
        kind: "nop",
        description: "does nothing",
        create: || Arc::new(Nop),
    };

    static FUTURE: PluginDescriptor = PluginDescriptor {
        api_version: 0x0002_0000,
        kind: "future",
        description: "",
        create: || Arc::new(Nop),
    };

    #[test]
    fn test_catalog_skips_incompatible_kinds() {
        let catalog = PluginCatalog::new().with(&NOP).with(&FUTURE);
        assert!(catalog.contains("nop"));
        assert!(!catalog.contains("future"));
        assert_eq!(catalog.create("nop").unwrap().manifest().name, "nop");
        assert!(catalog.create("missing").is_none());
        assert_eq!(catalog.kinds().collect::<Vec<_>>(), vec![("nop", "does nothing")]);
    }

    #[test]
    fn test_minor_version_compatibility() {
        let older = PluginDescriptor {
            api_version: CHORUS_PLUGIN_API_VERSION,
            ..NOP
        };
        assert!(older.is_compatible());
        let newer_minor = PluginDescriptor {
            api_version: CHORUS_PLUGIN_API_VERSION + 1,
            ..NOP
        };
        assert!(!newer_minor.is_compatible());
    }
}
