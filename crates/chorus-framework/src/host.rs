//! Operator controls exposed to plugins.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use chorus_core::{OutboundPayload, SendOptions};

use crate::context::HostServices;
use crate::error::RegistryResult;
use crate::registry::{PluginRegistry, ReloadReport};

/// Default delay between broadcast sends.
pub const DEFAULT_BROADCAST_PACING: Duration = Duration::from_millis(1500);

/// Result of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Chats the text reached.
    pub delivered: usize,
    /// Chats the send failed for.
    pub failed: Vec<String>,
}

/// Host-level operations available to privileged plugins.
#[async_trait]
pub trait HostControl: Send + Sync + 'static {
    /// Rescans the plugin source and applies the difference.
    async fn reload(&self) -> RegistryResult<ReloadReport>;

    /// Re-enables a disabled plugin.
    fn enable(&self, plugin: &str) -> RegistryResult<()>;

    /// Disables a plugin without unloading it.
    fn disable(&self, plugin: &str) -> RegistryResult<()>;

    /// Host, plugin and task statistics as JSON.
    fn stats(&self) -> Value;

    /// Sends `text` to every known chat, one at a time.
    async fn broadcast(&self, text: &str) -> BroadcastReport;
}

/// [`HostControl`] over a registry.
pub struct HostHandle {
    registry: Arc<PluginRegistry>,
    services: Arc<HostServices>,
    pacing: Duration,
    started: DateTime<Utc>,
}

impl HostHandle {
    /// Creates a handle; `started` is reported as the host start time.
    pub fn new(registry: Arc<PluginRegistry>, pacing: Duration, started: DateTime<Utc>) -> Self {
        let services = Arc::clone(registry.services());
        Self {
            registry,
            services,
            pacing,
            started,
        }
    }
}

#[async_trait]
impl HostControl for HostHandle {
    async fn reload(&self) -> RegistryResult<ReloadReport> {
        self.registry.reload_all().await
    }

    fn enable(&self, plugin: &str) -> RegistryResult<()> {
        self.registry.enable(plugin)
    }

    fn disable(&self, plugin: &str) -> RegistryResult<()> {
        self.registry.disable(plugin)
    }

    fn stats(&self) -> Value {
        let uptime = (Utc::now() - self.started).num_seconds().max(0);
        json!({
            "startedAt": self.started,
            "uptimeSec": uptime,
            "connection": self.services.gate.state().as_str(),
            "chats": self.services.directory.len(),
            "plugins": self.registry.reports(),
            "tasks": self.services.scheduler.stats(),
        })
    }

    async fn broadcast(&self, text: &str) -> BroadcastReport {
        let chats = self.services.directory.chats();
        info!(chats = chats.len(), "Broadcast started");
        let mut report = BroadcastReport::default();
        for (i, chat) in chats.iter().enumerate() {
            if i > 0 && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }
            match self
                .services
                .gate
                .send(&chat.id, OutboundPayload::text(text), SendOptions::default())
                .await
            {
                Ok(_) => report.delivered += 1,
                Err(e) => {
                    warn!(chat = %chat.id, error = %e, "Broadcast send failed");
                    report.failed.push(chat.id.to_string());
                }
            }
        }
        info!(delivered = report.delivered, failed = report.failed.len(), "Broadcast finished");
        report
    }
}

#[cfg(test)]
mod tests {
    use chorus_core::Jid;

    use super::*;
    use crate::context::tests::{services, text_message};
    use crate::plugin::{InlineSource, PluginCatalog};

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_reaches_every_known_chat() {
        let (services, client) = services().await;
        for chat in ["2348011111111", "120363025246125486@g.us"] {
            services
                .directory
                .record(&text_message(chat, "2348011111111", "hi").chat);
        }
        let registry = Arc::new(PluginRegistry::new(
            PluginCatalog::new(),
            Arc::new(InlineSource::default()),
            services,
        ));
        let host = HostHandle::new(registry, DEFAULT_BROADCAST_PACING, Utc::now());

        let report = host.broadcast("maintenance tonight").await;
        assert_eq!(report.delivered, 2);
        assert!(report.failed.is_empty());
        assert_eq!(
            client.sent_texts(&Jid::parse("2348011111111").unwrap()),
            vec!["maintenance tonight".to_string()]
        );
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let (services, _client) = services().await;
        let registry = Arc::new(PluginRegistry::new(
            PluginCatalog::new(),
            Arc::new(InlineSource::default()),
            services,
        ));
        let host = HostHandle::new(registry, Duration::ZERO, Utc::now());
        let stats = host.stats();
        assert_eq!(stats["connection"], "connected");
        assert!(stats["plugins"].as_array().unwrap().is_empty());
        assert!(stats["uptimeSec"].as_i64().unwrap() >= 0);
    }
}
