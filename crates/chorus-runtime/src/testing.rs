//! Shared fixtures for unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;

use chorus_core::{ConnectionState, Jid, MemoryChatClient, MemoryStore, RawMessage};
use chorus_framework::scheduler::DEFAULT_TIMEZONE;
use chorus_framework::{
    CHORUS_PLUGIN_API_VERSION, ChatDirectory, CollectionsGateway, EventBus, GatewayConfig,
    HandlerResult, HostClock, HostServices, HostSettings, Manifest, OutboundGate,
    PermissionResolver, Plugin, PluginContext, PluginDescriptor, RateLimiter, Scheduler, Wallet,
    WalletConfig,
};

/// Replies with its arguments.
struct Echo;

#[async_trait]
impl Plugin for Echo {
    fn manifest(&self) -> Manifest {
        Manifest::new("echo", "1.0.0").commands(["echo"]).serial()
    }

    async fn handle(&self, ctx: &PluginContext) -> HandlerResult {
        ctx.reply(ctx.args().join(" ")).await?;
        Ok(())
    }
}

pub(crate) static ECHO: PluginDescriptor = PluginDescriptor {
    api_version: CHORUS_PLUGIN_API_VERSION,
    kind: "echo",
    description: "Replies with its arguments",
    create: || Arc::new(Echo),
};

/// Services over in-memory backends around `client`, reported connected.
pub(crate) fn services_with_client(client: Arc<MemoryChatClient>) -> Arc<HostServices> {
    let (_tx, health) = watch::channel(ConnectionState::Connected);
    let gateway = Arc::new(CollectionsGateway::new(
        Arc::new(MemoryStore::new()),
        GatewayConfig::default(),
    ));
    Arc::new(HostServices {
        gate: OutboundGate::new(client.clone(), health.clone(), 8),
        wallet: Arc::new(Wallet::new(gateway.clone(), WalletConfig::default())),
        gateway,
        rate_limiter: Arc::new(RateLimiter::default()),
        permissions: Arc::new(PermissionResolver::new(client, None, vec![])),
        scheduler: Scheduler::new(health, DEFAULT_TIMEZONE, HostClock::system()),
        bus: Arc::new(EventBus::new()),
        directory: Arc::new(ChatDirectory::new()),
        settings: HostSettings::default(),
    })
}

/// A raw direct-chat text message from `from`.
pub(crate) fn direct_text(id: &str, from: &str, text: &str) -> RawMessage {
    serde_json::from_value(json!({
        "key": { "remoteJid": Jid::parse(from).map(|j| j.to_string()).unwrap_or_default(), "id": id, "fromMe": false },
        "messageTimestamp": 1_700_000_000,
        "message": { "conversation": text },
    }))
    .unwrap()
}
