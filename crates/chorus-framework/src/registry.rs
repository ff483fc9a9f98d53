//! Plugin registry: discovery, lifecycle and the command index.
//!
//! [`PluginRegistry`] owns every loaded plugin. It:
//!
//! - Scans a [`PluginSource`] and instantiates each file's kind from the
//!   [`PluginCatalog`], applying the file's manifest overrides and name.
//! - Runs `on_init` for each new instance, then ensures its indexes and
//!   registers its scheduled tasks. A failed init leaves the plugin loaded
//!   but marked [`PluginStatus::Failed`] and disabled; the host keeps going.
//! - Publishes an immutable [`RegistrySnapshot`] (plugins in load order,
//!   enabled set, command index). Every mutation builds a new snapshot and
//!   swaps it in, so readers see either the old or the new state.
//! - Keeps per-plugin execution stats that survive reloads.
//!
//! # Collisions
//!
//! At startup ([`load_all`](PluginRegistry::load_all)) a plugin whose name or
//! any command token is already taken is rejected with a logged error. On
//! [`reload_all`](PluginRegistry::reload_all) and
//! [`enable`](PluginRegistry::enable), a contested token stays with the
//! plugin loaded first; later claims are logged and ignored.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{Instrument, debug, error, info, warn};

use crate::context::{HostServices, Origin, PluginContext};
use crate::dispatcher::HandlerOutcome;
use crate::error::{RegistryError, RegistryResult};
use crate::plugin::{BoxedPlugin, Manifest, PluginCatalog, PluginFile, PluginSource};

/// Default deadline for `on_init`.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Loaded plugins
// =============================================================================

/// Whether a loaded plugin can run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginStatus {
    /// Initialised; eligible for dispatch when enabled.
    Active,
    /// `on_init` or task registration failed.
    Failed(String),
}

/// A plugin instance as the registry holds it.
pub struct LoadedPlugin {
    /// Unique name.
    pub name: Arc<str>,
    /// Catalog kind.
    pub kind: String,
    /// Plugin file it came from.
    pub file: String,
    /// Effective manifest (overrides applied).
    pub manifest: Arc<Manifest>,
    /// The live instance.
    pub plugin: BoxedPlugin,
    /// Effective config section.
    pub config: Arc<Value>,
    /// Content hash of the plugin file.
    pub fingerprint: u64,
    /// Load outcome.
    pub status: PluginStatus,
}

impl LoadedPlugin {
    /// Returns `true` when the plugin initialised.
    pub fn is_active(&self) -> bool {
        self.status == PluginStatus::Active
    }

    /// The handler deadline: the manifest override or `default`.
    pub fn deadline(&self, default: Duration) -> Duration {
        self.manifest.timeout_override().unwrap_or(default)
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("file", &self.file)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// An immutable view of the registry.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    plugins: Vec<Arc<LoadedPlugin>>,
    enabled: HashSet<Arc<str>>,
    command_index: HashMap<String, Arc<LoadedPlugin>>,
}

impl RegistrySnapshot {
    /// Builds the command index over the enabled plugins, first claim wins.
    fn build(plugins: Vec<Arc<LoadedPlugin>>, enabled: HashSet<Arc<str>>) -> Self {
        let mut command_index: HashMap<String, Arc<LoadedPlugin>> = HashMap::new();
        for plugin in plugins.iter().filter(|p| enabled.contains(&p.name)) {
            for token in plugin.manifest.tokens() {
                match command_index.get(&token) {
                    Some(owner) => warn!(
                        plugin = %plugin.name,
                        owner = %owner.name,
                        token = %token,
                        "Command token already taken, ignored"
                    ),
                    None => {
                        command_index.insert(token, Arc::clone(plugin));
                    }
                }
            }
        }
        Self {
            plugins,
            enabled,
            command_index,
        }
    }

    /// The enabled plugin owning `token` (case-insensitive).
    pub fn resolve(&self, token: &str) -> Option<&Arc<LoadedPlugin>> {
        self.command_index.get(&token.to_lowercase())
    }

    /// Looks up a plugin by name.
    pub fn get(&self, name: &str) -> Option<&Arc<LoadedPlugin>> {
        self.plugins.iter().find(|p| &*p.name == name)
    }

    /// Returns `true` when `name` is enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.contains(name)
    }

    /// Every loaded plugin in load order.
    pub fn plugins(&self) -> &[Arc<LoadedPlugin>] {
        &self.plugins
    }

    /// Enabled passive plugins in load order.
    pub fn passive(&self) -> impl Iterator<Item = &Arc<LoadedPlugin>> {
        self.plugins
            .iter()
            .filter(|p| p.manifest.passive && self.enabled.contains(&p.name))
    }

    /// Indexed tokens, sorted.
    pub fn commands(&self) -> Vec<(&str, &str)> {
        let mut commands: Vec<_> = self
            .command_index
            .iter()
            .map(|(token, p)| (token.as_str(), &*p.name))
            .collect();
        commands.sort_unstable();
        commands
    }

    /// Number of loaded plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Returns `true` when nothing is loaded.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

// =============================================================================
// Stats & reports
// =============================================================================

/// Execution counters for one plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginStats {
    /// Completed, failed, timed-out and cancelled invocations.
    pub executions: u64,
    /// Invocations that returned an error or panicked.
    pub errors: u64,
    /// Invocations that exceeded their deadline.
    pub timeouts: u64,
    /// Start of the latest invocation.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Time of the latest failure.
    pub last_error_at: Option<DateTime<Utc>>,
    /// Cumulative handler time.
    pub total_time_ms: u64,
}

impl PluginStats {
    fn record(&mut self, outcome: HandlerOutcome, elapsed: Duration, at: DateTime<Utc>) {
        if outcome == HandlerOutcome::Skipped {
            return;
        }
        self.executions += 1;
        self.last_run_at = Some(at);
        self.total_time_ms += elapsed.as_millis() as u64;
        match outcome {
            HandlerOutcome::Failed | HandlerOutcome::Panicked => {
                self.errors += 1;
                self.last_error_at = Some(at);
            }
            HandlerOutcome::TimedOut => {
                self.timeouts += 1;
                self.last_error_at = Some(at);
            }
            _ => {}
        }
    }
}

/// One row of the plugin listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginReport {
    /// Plugin name.
    pub name: String,
    /// Catalog kind.
    pub kind: String,
    /// Manifest version.
    pub version: String,
    /// Whether commands and tasks are live.
    pub enabled: bool,
    /// Init failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Command and alias tokens.
    pub commands: Vec<String>,
    /// Execution counters.
    #[serde(flatten)]
    pub stats: PluginStats,
}

/// What a load or reload did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    /// Newly loaded plugins.
    pub loaded: Vec<String>,
    /// Plugins re-initialised because their file changed.
    pub reloaded: Vec<String>,
    /// Plugins kept as they were.
    pub unchanged: Vec<String>,
    /// Plugins whose file disappeared.
    pub removed: Vec<String>,
    /// Plugins loaded but failed to initialise.
    pub failed: Vec<String>,
    /// Files or plugins rejected outright, with the reason.
    pub rejected: Vec<String>,
}

// =============================================================================
// PluginRegistry
// =============================================================================

/// Central owner of loaded plugins.
pub struct PluginRegistry {
    catalog: PluginCatalog,
    source: Arc<dyn PluginSource>,
    services: Arc<HostServices>,
    config_overlay: HashMap<String, Value>,
    init_timeout: Duration,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    stats: Mutex<HashMap<String, PluginStats>>,
    reload_lock: tokio::sync::Mutex<()>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new(
        catalog: PluginCatalog,
        source: Arc<dyn PluginSource>,
        services: Arc<HostServices>,
    ) -> Self {
        Self {
            catalog,
            source,
            services,
            config_overlay: HashMap::new(),
            init_timeout: DEFAULT_INIT_TIMEOUT,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
            stats: Mutex::new(HashMap::new()),
            reload_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Config sections from the host configuration, keyed by plugin name.
    /// Top-level keys override the plugin file's `[config]` table.
    pub fn with_config_overlay(mut self, overlay: HashMap<String, Value>) -> Self {
        self.config_overlay = overlay;
        self
    }

    /// Sets the `on_init` deadline.
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// The shared services handed to plugin contexts.
    pub fn services(&self) -> &Arc<HostServices> {
        &self.services
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Resolves a command token against the current snapshot.
    pub fn resolve(&self, token: &str) -> Option<Arc<LoadedPlugin>> {
        self.snapshot.read().resolve(token).cloned()
    }

    // ─── Loading ─────────────────────────────────────────────────────────────

    /// Initial load. Fails only when the source itself is unusable.
    pub async fn load_all(&self) -> RegistryResult<ReloadReport> {
        let _guard = self.reload_lock.lock().await;
        let files = self.source.scan().await?;
        let mut report = ReloadReport::default();
        let mut accepted: Vec<Arc<LoadedPlugin>> = Vec::new();
        let mut enabled = HashSet::new();

        for file in files {
            let file = match file {
                Ok(file) => file,
                Err(e) => {
                    error!(error = %e, "Skipping plugin file");
                    report.rejected.push(e.to_string());
                    continue;
                }
            };
            match self.load_file(&file, &accepted, true).await {
                Ok(loaded) => {
                    note_loaded(&loaded, &file, &mut enabled, &mut report.loaded, &mut report.failed);
                    self.apply_pause(&loaded, &enabled);
                    accepted.push(loaded);
                }
                Err(e) => {
                    error!(file = %file.file, error = %e, "Plugin rejected");
                    report.rejected.push(e.to_string());
                }
            }
        }

        self.publish(accepted, enabled);
        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            rejected = report.rejected.len(),
            "Plugins loaded"
        );
        Ok(report)
    }

    /// Re-scans the source and applies the difference.
    ///
    /// Unchanged files keep their live instance and enabled state; changed
    /// files are unloaded and re-initialised; removed files are unloaded.
    pub async fn reload_all(&self) -> RegistryResult<ReloadReport> {
        let _guard = self.reload_lock.lock().await;
        let files = self.source.scan().await?;
        let old = self.snapshot();
        let mut report = ReloadReport::default();

        // Plan: which old instances survive.
        let mut plan: Vec<(PluginFile, Option<Arc<LoadedPlugin>>)> = Vec::new();
        for file in files {
            match file {
                Ok(file) => {
                    let reuse = old
                        .plugins()
                        .iter()
                        .find(|p| {
                            p.file == file.file
                                && p.fingerprint == file.fingerprint
                                && p.kind == file.kind
                        })
                        .cloned();
                    plan.push((file, reuse));
                }
                Err(e) => {
                    error!(error = %e, "Skipping plugin file");
                    report.rejected.push(e.to_string());
                }
            }
        }

        // Retire every old instance that is not reused.
        let mut changed_files = HashSet::new();
        for plugin in old.plugins() {
            let reused = plan
                .iter()
                .any(|(_, r)| r.as_ref().is_some_and(|r| Arc::ptr_eq(r, plugin)));
            if reused {
                continue;
            }
            if plan.iter().any(|(f, _)| f.file == plugin.file) {
                changed_files.insert(plugin.file.clone());
            } else {
                report.removed.push(plugin.name.to_string());
            }
            self.retire(plugin, true).await;
        }

        let mut accepted: Vec<Arc<LoadedPlugin>> = Vec::new();
        let mut enabled = HashSet::new();
        for (file, reuse) in plan {
            if let Some(plugin) = reuse {
                if let Some(existing) = accepted.iter().find(|p| p.name == plugin.name) {
                    // A new file took the name first; its tasks replaced ours.
                    error!(plugin = %plugin.name, existing = %existing.file, "Plugin name collision");
                    report.rejected.push(format!("{}: name taken", plugin.name));
                    self.retire(&plugin, false).await;
                    continue;
                }
                if old.is_enabled(&plugin.name) {
                    enabled.insert(Arc::clone(&plugin.name));
                }
                report.unchanged.push(plugin.name.to_string());
                accepted.push(plugin);
                continue;
            }

            match self.load_file(&file, &accepted, false).await {
                Ok(loaded) => {
                    let bucket = if changed_files.contains(&file.file) {
                        &mut report.reloaded
                    } else {
                        &mut report.loaded
                    };
                    note_loaded(&loaded, &file, &mut enabled, bucket, &mut report.failed);
                    self.apply_pause(&loaded, &enabled);
                    accepted.push(loaded);
                }
                Err(e) => {
                    error!(file = %file.file, error = %e, "Plugin rejected");
                    report.rejected.push(e.to_string());
                }
            }
        }

        self.publish(accepted, enabled);
        info!(
            loaded = report.loaded.len(),
            reloaded = report.reloaded.len(),
            unchanged = report.unchanged.len(),
            removed = report.removed.len(),
            "Plugins reloaded"
        );
        Ok(report)
    }

    async fn load_file(
        &self,
        file: &PluginFile,
        accepted: &[Arc<LoadedPlugin>],
        strict: bool,
    ) -> RegistryResult<Arc<LoadedPlugin>> {
        let plugin = self
            .catalog
            .create(&file.kind)
            .ok_or_else(|| RegistryError::UnknownKind {
                file: file.file.clone(),
                kind: file.kind.clone(),
            })?;

        let mut manifest = file.overrides.apply(plugin.manifest());
        if let Some(name) = &file.name {
            manifest.name = name.clone();
        }
        manifest.validate()?;

        if let Some(existing) = accepted.iter().find(|p| *p.name == manifest.name) {
            return Err(RegistryError::Collision {
                plugin: manifest.name.clone(),
                existing: existing.file.clone(),
                token: manifest.name.clone(),
            });
        }
        if strict {
            for token in manifest.tokens() {
                if let Some(owner) = accepted
                    .iter()
                    .filter(|p| p.is_active())
                    .find(|p| p.manifest.tokens().contains(&token))
                {
                    return Err(RegistryError::Collision {
                        plugin: manifest.name.clone(),
                        existing: owner.name.to_string(),
                        token,
                    });
                }
            }
        }

        let config = Arc::new(self.config_for(&manifest.name, &file.config));
        Ok(self.activate(plugin, manifest, file, config).await)
    }

    async fn activate(
        &self,
        plugin: BoxedPlugin,
        manifest: Manifest,
        file: &PluginFile,
        config: Arc<Value>,
    ) -> Arc<LoadedPlugin> {
        let name: Arc<str> = Arc::from(manifest.name.as_str());
        let status = match self.run_init(&name, &plugin, &config).await {
            Ok(()) => self.register_resources(&name, &plugin, &manifest).await,
            Err(reason) => PluginStatus::Failed(reason),
        };

        match &status {
            PluginStatus::Active => info!(
                plugin = %name,
                version = %manifest.version,
                commands = ?manifest.tokens(),
                tasks = manifest.scheduled_tasks.len(),
                "Plugin loaded"
            ),
            PluginStatus::Failed(reason) => error!(
                plugin = %name,
                reason = %reason,
                "Plugin failed to initialize, disabled"
            ),
        }

        Arc::new(LoadedPlugin {
            name,
            kind: file.kind.clone(),
            file: file.file.clone(),
            manifest: Arc::new(manifest),
            plugin,
            config,
            fingerprint: file.fingerprint,
            status,
        })
    }

    async fn run_init(
        &self,
        name: &Arc<str>,
        plugin: &BoxedPlugin,
        config: &Arc<Value>,
    ) -> Result<(), String> {
        let ctx = PluginContext::new(
            Arc::clone(name),
            Origin::Init,
            Arc::clone(config),
            Arc::clone(&self.services),
        );
        let span = ctx.span().clone();
        let init = AssertUnwindSafe(plugin.on_init(&ctx)).catch_unwind();
        match tokio::time::timeout(self.init_timeout, init)
            .instrument(span)
            .await
        {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(_)) => Err("init hook panicked".into()),
            Err(_) => Err(format!("init hook timed out after {:?}", self.init_timeout)),
        }
    }

    async fn register_resources(
        &self,
        name: &str,
        plugin: &BoxedPlugin,
        manifest: &Manifest,
    ) -> PluginStatus {
        if let Err(e) = self.services.gateway.ensure_indexes(&manifest.indexes).await {
            // Index creation is idempotent and retried on the next reload.
            warn!(plugin = name, error = %e, "Failed to ensure plugin indexes");
        }
        if let Err(e) = self
            .services
            .scheduler
            .register(name, &manifest.scheduled_tasks)
        {
            plugin.on_unload().await;
            return PluginStatus::Failed(e.to_string());
        }
        PluginStatus::Active
    }

    fn config_for(&self, name: &str, file_config: &Value) -> Value {
        let base = match file_config {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        };
        match (base, self.config_overlay.get(name)) {
            (Value::Object(mut base), Some(Value::Object(overlay))) => {
                for (k, v) in overlay {
                    base.insert(k.clone(), v.clone());
                }
                Value::Object(base)
            }
            (_, Some(overlay)) => overlay.clone(),
            (base, None) => base,
        }
    }

    fn apply_pause(&self, plugin: &LoadedPlugin, enabled: &HashSet<Arc<str>>) {
        if plugin.is_active() && !enabled.contains(&plugin.name) {
            self.services.scheduler.set_paused(&plugin.name, true);
        }
    }

    async fn retire(&self, plugin: &LoadedPlugin, unregister_tasks: bool) {
        if unregister_tasks {
            self.services.scheduler.unregister_plugin(&plugin.name);
        }
        if plugin.is_active() {
            plugin.plugin.on_unload().await;
        }
        info!(plugin = %plugin.name, "Plugin unloaded");
    }

    fn publish(&self, plugins: Vec<Arc<LoadedPlugin>>, enabled: HashSet<Arc<str>>) {
        let names: HashSet<&str> = plugins.iter().map(|p| &*p.name).collect();
        self.stats.lock().retain(|name, _| names.contains(name.as_str()));
        *self.snapshot.write() = Arc::new(RegistrySnapshot::build(plugins, enabled));
    }

    // ─── Operations ──────────────────────────────────────────────────────────

    /// Enables a plugin: indexes its tokens and resumes its tasks.
    pub fn enable(&self, name: &str) -> RegistryResult<()> {
        self.set_enabled(name, true)?;
        self.services.scheduler.set_paused(name, false);
        info!(plugin = name, "Plugin enabled");
        Ok(())
    }

    /// Disables a plugin: drops its tokens and pauses its tasks.
    pub fn disable(&self, name: &str) -> RegistryResult<()> {
        self.set_enabled(name, false)?;
        self.services.scheduler.set_paused(name, true);
        info!(plugin = name, "Plugin disabled");
        Ok(())
    }

    fn set_enabled(&self, name: &str, on: bool) -> RegistryResult<()> {
        let mut slot = self.snapshot.write();
        let plugin = slot
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if on && !plugin.is_active() {
            return Err(RegistryError::Failed(name.to_string()));
        }
        let mut enabled = slot.enabled.clone();
        if on {
            enabled.insert(Arc::clone(&plugin.name));
        } else {
            enabled.remove(&plugin.name);
        }
        *slot = Arc::new(RegistrySnapshot::build(slot.plugins.clone(), enabled));
        Ok(())
    }

    /// Unloads everything in reverse load order.
    pub async fn unload_all(&self) {
        let _guard = self.reload_lock.lock().await;
        let old = std::mem::take(&mut *self.snapshot.write());
        for plugin in old.plugins().iter().rev() {
            self.retire(plugin, true).await;
        }
        debug!(count = old.len(), "All plugins unloaded");
    }

    // ─── Stats ───────────────────────────────────────────────────────────────

    /// Records one invocation.
    pub fn record(&self, plugin: &str, outcome: HandlerOutcome, elapsed: Duration) {
        self.stats
            .lock()
            .entry(plugin.to_string())
            .or_default()
            .record(outcome, elapsed, Utc::now());
    }

    /// Counters of one plugin.
    pub fn stats(&self, plugin: &str) -> PluginStats {
        self.stats.lock().get(plugin).cloned().unwrap_or_default()
    }

    /// One row per loaded plugin, in load order.
    pub fn reports(&self) -> Vec<PluginReport> {
        let snapshot = self.snapshot();
        let stats = self.stats.lock();
        snapshot
            .plugins()
            .iter()
            .map(|p| PluginReport {
                name: p.name.to_string(),
                kind: p.kind.clone(),
                version: p.manifest.version.clone(),
                enabled: snapshot.is_enabled(&p.name),
                failure: match &p.status {
                    PluginStatus::Failed(reason) => Some(reason.clone()),
                    PluginStatus::Active => None,
                },
                commands: p.manifest.tokens(),
                stats: stats.get(&*p.name).cloned().unwrap_or_default(),
            })
            .collect()
    }
}

fn note_loaded(
    loaded: &Arc<LoadedPlugin>,
    file: &PluginFile,
    enabled: &mut HashSet<Arc<str>>,
    bucket: &mut Vec<String>,
    failed: &mut Vec<String>,
) {
    if loaded.is_active() {
        if file.enabled {
            enabled.insert(Arc::clone(&loaded.name));
        }
        bucket.push(loaded.name.to_string());
    } else {
        failed.push(loaded.name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::context::PluginContext as Ctx;
    use crate::context::tests::services;
    use crate::error::HandlerResult;
    use crate::plugin::{CHORUS_PLUGIN_API_VERSION, InlineSource, Plugin, PluginDescriptor};
    use crate::scheduler::TaskSpec;

    struct Fixed(Manifest, bool);

    #[async_trait]
    impl Plugin for Fixed {
        fn manifest(&self) -> Manifest {
            self.0.clone()
        }

        async fn handle(&self, _ctx: &Ctx) -> HandlerResult {
            Ok(())
        }

        async fn on_init(&self, ctx: &Ctx) -> HandlerResult {
            ctx.publish("lifecycle", json!({ "init": ctx.plugin_name() }));
            if self.1 {
                return Err("database not reachable".into());
            }
            Ok(())
        }
    }

    static UNLOADS: AtomicUsize = AtomicUsize::new(0);

    struct Tracked;

    #[async_trait]
    impl Plugin for Tracked {
        fn manifest(&self) -> Manifest {
            Manifest::new("tracked", "1.0.0").commands(["tracked"])
        }

        async fn handle(&self, _ctx: &Ctx) -> HandlerResult {
            Ok(())
        }

        async fn on_unload(&self) {
            UNLOADS.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn catalog() -> PluginCatalog {
        static PING: PluginDescriptor = PluginDescriptor {
            api_version: CHORUS_PLUGIN_API_VERSION,
            kind: "ping",
            description: "",
            create: || Arc::new(Fixed(Manifest::new("ping", "1.0.0").commands(["ping", "p"]), false)),
        };
        static PONG: PluginDescriptor = PluginDescriptor {
            api_version: CHORUS_PLUGIN_API_VERSION,
            kind: "pong",
            description: "",
            create: || Arc::new(Fixed(Manifest::new("pong", "1.0.0").commands(["pong", "P"]), false)),
        };
        static BROKEN: PluginDescriptor = PluginDescriptor {
            api_version: CHORUS_PLUGIN_API_VERSION,
            kind: "broken",
            description: "",
            create: || Arc::new(Fixed(Manifest::new("broken", "0.1.0").commands(["broken"]), true)),
        };
        static TICKER: PluginDescriptor = PluginDescriptor {
            api_version: CHORUS_PLUGIN_API_VERSION,
            kind: "ticker",
            description: "",
            create: || {
                Arc::new(Fixed(
                    Manifest::new("ticker", "1.0.0")
                        .commands(["tick"])
                        .task(TaskSpec::new("beat", "* * * * *")),
                    false,
                ))
            },
        };
        static TRACKED: PluginDescriptor = PluginDescriptor {
            api_version: CHORUS_PLUGIN_API_VERSION,
            kind: "tracked",
            description: "",
            create: || Arc::new(Tracked),
        };
        PluginCatalog::new()
            .with(&PING)
            .with(&PONG)
            .with(&BROKEN)
            .with(&TICKER)
            .with(&TRACKED)
    }

    #[tokio::test]
    async fn test_load_all_rejects_collisions_and_isolates_failures() {
        let (services, _client) = services().await;
        let mut lifecycle = services.bus.subscribe("lifecycle");
        let source = Arc::new(InlineSource::new(vec![
            PluginFile::new("10-ping.toml", "ping"),
            PluginFile::new("20-broken.toml", "broken"),
            PluginFile::new("30-pong.toml", "pong"),
            PluginFile::new("40-ping-again.toml", "ping"),
            PluginFile::new("50-nope.toml", "nope"),
        ]));
        let registry = PluginRegistry::new(catalog(), source, services);

        let report = registry.load_all().await.unwrap();
        assert_eq!(report.loaded, vec!["ping"]);
        assert_eq!(report.failed, vec!["broken"]);
        // pong claims "p"; the second ping repeats a name; nope is unknown.
        assert_eq!(report.rejected.len(), 3);

        let snapshot = registry.snapshot();
        assert_eq!(&*snapshot.resolve("PING").unwrap().name, "ping");
        assert!(snapshot.resolve("broken").is_none());
        assert!(!snapshot.is_enabled("broken"));
        assert!(matches!(
            registry.enable("broken"),
            Err(RegistryError::Failed(_))
        ));

        let first = lifecycle.recv().await.unwrap();
        assert_eq!(first.payload["init"], "ping");
    }

    #[tokio::test]
    async fn test_reload_reuses_unchanged_and_reinits_changed() {
        let (services, _client) = services().await;
        let source = Arc::new(InlineSource::new(vec![
            PluginFile::new("10-ping.toml", "ping"),
            PluginFile::new("20-tracked.toml", "tracked"),
            PluginFile::new("30-ticker.toml", "ticker"),
        ]));
        let registry = PluginRegistry::new(catalog(), source.clone(), services.clone());
        registry.load_all().await.unwrap();
        let ping_before = registry.snapshot().get("ping").cloned().unwrap();
        registry.record("ping", HandlerOutcome::Completed, Duration::from_millis(5));
        let unloads = UNLOADS.load(Ordering::SeqCst);

        source.set(vec![
            PluginFile::new("10-ping.toml", "ping"),
            PluginFile::new("30-ticker.toml", "ticker").with_config(json!({ "v": 2 })),
            PluginFile::new("40-pong.toml", "pong").named("pong2"),
        ]);
        let report = registry.reload_all().await.unwrap();

        assert_eq!(report.unchanged, vec!["ping"]);
        assert_eq!(report.reloaded, vec!["ticker"]);
        assert_eq!(report.loaded, vec!["pong2"]);
        assert_eq!(report.removed, vec!["tracked"]);
        assert_eq!(UNLOADS.load(Ordering::SeqCst), unloads + 1);

        let snapshot = registry.snapshot();
        assert!(Arc::ptr_eq(snapshot.get("ping").unwrap(), &ping_before));
        assert_eq!(snapshot.get("ticker").unwrap().config["v"], 2);
        // "p" stays with ping; pong2 keeps only "pong".
        assert_eq!(&*snapshot.resolve("p").unwrap().name, "ping");
        assert_eq!(&*snapshot.resolve("pong").unwrap().name, "pong2");
        assert!(snapshot.resolve("tracked").is_none());
        assert_eq!(registry.stats("ping").executions, 1);
        assert_eq!(services.scheduler.stats().len(), 1);
    }

    #[tokio::test]
    async fn test_disable_drops_tokens_and_pauses_tasks() {
        let (services, _client) = services().await;
        let source = Arc::new(InlineSource::new(vec![PluginFile::new("a.toml", "ticker")]));
        let registry = PluginRegistry::new(catalog(), source, services.clone());
        registry.load_all().await.unwrap();
        assert!(registry.resolve("tick").is_some());

        registry.disable("ticker").unwrap();
        assert!(registry.resolve("tick").is_none());
        assert!(services.scheduler.stats()[0].paused);

        registry.enable("ticker").unwrap();
        assert!(registry.resolve("tick").is_some());
        assert!(!services.scheduler.stats()[0].paused);

        assert!(matches!(registry.disable("ghost"), Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_disabled_file_starts_paused() {
        let (services, _client) = services().await;
        let source = Arc::new(InlineSource::new(vec![
            PluginFile::new("a.toml", "ticker").disabled(),
        ]));
        let registry = PluginRegistry::new(catalog(), source, services.clone());
        registry.load_all().await.unwrap();

        let reports = registry.reports();
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].enabled);
        assert!(services.scheduler.stats()[0].paused);
    }

    #[tokio::test]
    async fn test_config_overlay_wins_per_key() {
        let (services, _client) = services().await;
        let source = Arc::new(InlineSource::new(vec![
            PluginFile::new("a.toml", "ping").with_config(json!({ "greeting": "hi", "times": 1 })),
        ]));
        let overlay = HashMap::from([("ping".to_string(), json!({ "times": 3 }))]);
        let registry = PluginRegistry::new(catalog(), source, services).with_config_overlay(overlay);
        registry.load_all().await.unwrap();

        let config = registry.snapshot().get("ping").unwrap().config.clone();
        assert_eq!(*config, json!({ "greeting": "hi", "times": 3 }));
    }

    #[tokio::test]
    async fn test_stats_record_outcomes() {
        let mut stats = PluginStats::default();
        let now = Utc::now();
        stats.record(HandlerOutcome::Completed, Duration::from_millis(10), now);
        stats.record(HandlerOutcome::Failed, Duration::from_millis(10), now);
        stats.record(HandlerOutcome::TimedOut, Duration::from_millis(10), now);
        stats.record(HandlerOutcome::Skipped, Duration::from_millis(10), now);
        assert_eq!(stats.executions, 3);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.total_time_ms, 30);
        assert_eq!(stats.last_error_at, Some(now));
    }
}
