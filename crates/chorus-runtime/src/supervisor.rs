//! Lifecycle supervisor: ordered startup, signal handling and shutdown.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use chorus_runtime::{Host, config::load_config};
//!
//! let config = load_config()?;
//! let _guard = chorus_runtime::logging::init_from_config(&config.logging);
//!
//! let host = Host::builder(config, client)
//!     .plugin(&economy::ECONOMY)
//!     .start()
//!     .await?;
//!
//! // Until Ctrl+C or SIGTERM; a second signal exits immediately.
//! host.run().await?;
//! ```
//!
//! Startup runs in a fixed order and aborts on the first failure: store,
//! gateway ping, wallet indexes, permissions, services, plugin load (which
//! registers scheduled tasks), dispatcher, client connect, event pump,
//! scheduler loop, housekeeping and the optional health endpoint.
//!
//! Shutdown reverses it: stop the pump, stop the scheduler, drain
//! handlers, flush the ledger and the store, unload plugins, close the
//! client.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use chorus_core::{BoxedChatClient, ClientError, open_store};
use chorus_framework::builtin;
use chorus_framework::{
    ChatDirectory, Classifier, CollectionsGateway, DirectorySource, Dispatcher, EventBus,
    HostClock, HostHandle, HostServices, HostSettings, OutboundGate, PermissionResolver,
    PluginCatalog, PluginDescriptor, PluginRegistry, PluginSource, RateLimiter, Scheduler,
    Wallet,
};

use crate::config::{ChorusConfig, validate_config};
use crate::error::RuntimeResult;
use crate::health::{self, HealthState};
use crate::pump::EventPump;

/// Exit code used when a second signal interrupts shutdown.
pub const FORCED_EXIT_CODE: i32 = 130;

// =============================================================================
// HostBuilder
// =============================================================================

/// Collects what the host needs before [`start`](Self::start).
pub struct HostBuilder {
    config: ChorusConfig,
    client: BoxedChatClient,
    catalog: PluginCatalog,
    source: Option<Arc<dyn PluginSource>>,
    clock: HostClock,
}

impl HostBuilder {
    fn new(config: ChorusConfig, client: BoxedChatClient) -> Self {
        let mut catalog = PluginCatalog::new();
        for descriptor in builtin::descriptors() {
            catalog.register(descriptor);
        }
        Self {
            config,
            client,
            catalog,
            source: None,
            clock: HostClock::system(),
        }
    }

    /// Makes a compiled-in plugin kind available to plugin files.
    pub fn plugin(mut self, descriptor: &PluginDescriptor) -> Self {
        self.catalog.register(descriptor);
        self
    }

    /// Reads plugin files from `source` instead of `host.plugin_dir`.
    pub fn source(mut self, source: Arc<dyn PluginSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Overrides the scheduler clock.
    pub fn clock(mut self, clock: HostClock) -> Self {
        self.clock = clock;
        self
    }

    /// Validates the configuration and brings the host up.
    pub async fn start(self) -> RuntimeResult<Host> {
        let Self {
            config,
            client,
            catalog,
            source,
            clock,
        } = self;
        let validated = validate_config(&config)?;

        // Store.
        let store = open_store(&config.store.uri).await?;
        let gateway = Arc::new(CollectionsGateway::new(store, config.store.gateway_config()));
        gateway.ping().await?;
        info!(store = gateway.endpoint(), "Store reachable");

        let wallet = Arc::new(Wallet::new(
            Arc::clone(&gateway),
            config.wallet.wallet_config(),
        ));
        wallet.ensure_indexes().await?;

        // Services.
        let permissions = Arc::new(
            PermissionResolver::new(Arc::clone(&client), validated.owner, validated.admins)
                .with_ttl(Duration::from_millis(config.host.metadata_ttl_ms)),
        );
        let (health_tx, health_rx) = watch::channel(client.connection_state());
        let gate = OutboundGate::new(
            Arc::clone(&client),
            health_rx.clone(),
            config.host.outbound_buffer,
        );
        let scheduler = Scheduler::new(health_rx, validated.timezone, clock);
        let services = Arc::new(HostServices {
            gate,
            gateway: Arc::clone(&gateway),
            wallet: Arc::clone(&wallet),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit.capacity)),
            permissions: Arc::clone(&permissions),
            scheduler: scheduler.clone(),
            bus: Arc::new(EventBus::new()),
            directory: Arc::new(ChatDirectory::new()),
            settings: HostSettings {
                prefix: validated.prefix,
                mode: config.host.mode,
            },
        });

        // Plugins.
        let source = source
            .unwrap_or_else(|| Arc::new(DirectorySource::new(config.host.plugin_dir.clone())));
        let registry = Arc::new(
            PluginRegistry::new(catalog, source, Arc::clone(&services))
                .with_config_overlay(config.plugins.clone())
                .with_init_timeout(Duration::from_millis(config.dispatch.init_timeout_ms)),
        );
        let report = registry.load_all().await?;
        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            rejected = report.rejected.len(),
            "Plugins loaded"
        );

        // Dispatch.
        let started = Utc::now();
        let dispatcher = Dispatcher::new(Arc::clone(&registry), config.dispatch.dispatch_config());
        dispatcher.set_host(Arc::new(HostHandle::new(
            Arc::clone(&registry),
            Duration::from_millis(config.host.broadcast_pacing_ms),
            started,
        )));
        scheduler.set_executor(Arc::new(dispatcher.clone()));

        // Session.
        let events = client.take_events().ok_or(ClientError::StreamTaken)?;
        let cancel = CancellationToken::new();
        let pump = Arc::new(EventPump::new(
            Classifier::new(validated.prefix, client.host_identity()),
            dispatcher.clone(),
            health_tx,
        ));
        let pump_task = {
            let pump = Arc::clone(&pump);
            let cancel = cancel.child_token();
            tokio::spawn(async move { pump.run(events, cancel).await })
        };
        client.connect().await?;
        if let Some(identity) = client.host_identity() {
            permissions.set_host_identity(identity);
        }

        scheduler.start();

        // Housekeeping.
        let background = TaskTracker::new();
        let sweeper = services.rate_limiter.spawn_sweeper(
            Duration::from_millis(config.rate_limit.sweep_interval_ms),
            cancel.child_token(),
        );
        background.spawn(async move {
            if let Err(e) = sweeper.await {
                warn!(error = %e, "Rate-limit sweeper ended abnormally");
            }
        });
        let pruner = permissions.spawn_sweeper(cancel.child_token());
        background.spawn(async move {
            if let Err(e) = pruner.await {
                warn!(error = %e, "Group metadata sweeper ended abnormally");
            }
        });
        background.spawn(flush_loop(
            Arc::clone(&wallet),
            Arc::clone(&gateway),
            Duration::from_millis(config.store.flush_interval_ms),
            cancel.child_token(),
        ));

        let health_addr = match validated.health_bind {
            Some(addr) => Some(
                health::serve(addr, HealthState::new(Arc::clone(&registry)), cancel.child_token())
                    .await?,
            ),
            None => None,
        };

        info!(
            prefix = %validated.prefix,
            mode = ?config.host.mode,
            plugins = registry.snapshot().len(),
            "Host started"
        );

        Ok(Host {
            config,
            client,
            services,
            registry,
            dispatcher,
            pump,
            pump_task,
            background,
            cancel,
            health_addr,
        })
    }
}

async fn flush_loop(
    wallet: Arc<Wallet>,
    gateway: Arc<CollectionsGateway>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match wallet.flush_ledger().await {
                    Ok(0) => {}
                    Ok(n) => debug!(entries = n, "Ledger flushed"),
                    Err(e) => warn!(error = %e, "Ledger flush failed, will retry"),
                }
                if let Err(e) = gateway.flush().await {
                    warn!(error = %e, "Store flush failed, will retry");
                }
            }
        }
    }
}

// =============================================================================
// Host
// =============================================================================

/// A running host.
pub struct Host {
    config: ChorusConfig,
    client: BoxedChatClient,
    services: Arc<HostServices>,
    registry: Arc<PluginRegistry>,
    dispatcher: Dispatcher,
    pump: Arc<EventPump>,
    pump_task: JoinHandle<()>,
    background: TaskTracker,
    cancel: CancellationToken,
    health_addr: Option<SocketAddr>,
}

impl Host {
    /// Starts building a host around `client`.
    pub fn builder(config: ChorusConfig, client: BoxedChatClient) -> HostBuilder {
        HostBuilder::new(config, client)
    }

    /// The configuration the host started with.
    pub fn config(&self) -> &ChorusConfig {
        &self.config
    }

    /// Shared services.
    pub fn services(&self) -> &Arc<HostServices> {
        &self.services
    }

    /// The plugin registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Chats with a live ordering lane.
    pub fn active_lanes(&self) -> usize {
        self.pump.active_lanes()
    }

    /// Where the health endpoint listens, when enabled.
    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health_addr
    }

    /// Runs until Ctrl+C or SIGTERM, then shuts down. A second signal
    /// during shutdown exits the process with [`FORCED_EXIT_CODE`].
    pub async fn run(self) -> RuntimeResult<()> {
        info!("Chorus is now running. Press Ctrl+C to stop.");
        wait_for_signal().await;

        tokio::spawn(async {
            wait_for_signal().await;
            error!("Second signal received, exiting immediately");
            std::process::exit(FORCED_EXIT_CODE);
        });

        self.shutdown().await
    }

    /// Runs until `shutdown` resolves, then shuts down.
    pub async fn run_until<F>(self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        shutdown.await;
        self.shutdown().await
    }

    /// Stops everything in order. Individual step failures are logged and
    /// shutdown continues.
    pub async fn shutdown(self) -> RuntimeResult<()> {
        info!("Shutting down");

        self.cancel.cancel();
        if let Err(e) = self.pump_task.await {
            warn!(error = %e, "Event pump ended abnormally");
        }

        let scheduler_deadline = Duration::from_millis(self.config.scheduler.shutdown_timeout_ms);
        if !self.services.scheduler.shutdown(scheduler_deadline).await {
            warn!("Scheduler did not stop before its deadline");
        }

        let drain_deadline = Duration::from_millis(self.config.dispatch.drain_timeout_ms);
        if !self.dispatcher.drain(drain_deadline).await {
            warn!("Some handlers were cancelled at the drain deadline");
        }

        self.background.close();
        self.background.wait().await;

        match self.services.wallet.flush_ledger().await {
            Ok(n) => debug!(entries = n, "Ledger flushed"),
            Err(e) => error!(error = %e, "Final ledger flush failed"),
        }
        if let Err(e) = self.services.gateway.flush().await {
            error!(error = %e, "Final store flush failed");
        }

        self.registry.unload_all().await;

        if let Err(e) = self.client.close().await {
            warn!(error = %e, "Chat client did not close cleanly");
        }

        info!("Host stopped");
        Ok(())
    }
}

/// Waits for Ctrl+C or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Cannot listen for SIGTERM, using Ctrl+C only"),
        }
    }

    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Cannot listen for Ctrl+C");
        futures::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down");
}

#[cfg(test)]
mod tests {
    use chorus_core::{ChatClient, ConnectionState, Jid, MemoryChatClient};
    use chorus_framework::{InlineSource, PluginFile, RegistryError};

    use super::*;
    use crate::error::RuntimeError;
    use crate::testing::{ECHO, direct_text};

    fn client() -> Arc<MemoryChatClient> {
        Arc::new(MemoryChatClient::new(Jid::parse("2348000000000").unwrap()))
    }

    #[tokio::test]
    async fn test_missing_plugin_directory_is_fatal() {
        let mut config = ChorusConfig::default();
        config.host.plugin_dir = "/nonexistent/chorus/plugins".into();
        let result = Host::builder(config, client()).start().await;
        assert!(matches!(
            result,
            Err(RuntimeError::Registry(RegistryError::DirectoryMissing(_)))
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let mut config = ChorusConfig::default();
        config.host.prefix = "ab".into();
        let result = Host::builder(config, client()).start().await;
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_connects_and_shutdown_closes() {
        let client = client();
        let source = InlineSource::new(vec![PluginFile::new("echo.toml", "echo")]);
        let host = Host::builder(ChorusConfig::default(), client.clone())
            .plugin(&ECHO)
            .source(Arc::new(source))
            .start()
            .await
            .unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Connected);
        assert!(host.registry().resolve("echo").is_some());

        client
            .inject(direct_text("m1", "2348011111111", ".echo up"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        host.shutdown().await.unwrap();
        assert_eq!(
            client.sent_texts(&Jid::parse("2348011111111").unwrap()),
            vec!["up".to_string()]
        );
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }
}
