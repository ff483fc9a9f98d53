//! Host-admin plugin.
//!
//! | Command | Effect |
//! |---------|--------|
//! | `reload` | Rescans plugin files and applies the difference |
//! | `enable <plugin>` | Re-enables a disabled plugin |
//! | `disable <plugin>` | Disables a plugin and pauses its tasks |
//! | `stats` | Replies with host, plugin and task statistics as JSON |
//! | `broadcast <text>` | Sends `<text>` to every known chat, paced |
//!
//! Every command requires host admin.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::context::PluginContext;
use crate::error::HandlerResult;
use crate::plugin::{CHORUS_PLUGIN_API_VERSION, Manifest, Plugin, PluginDescriptor};

/// Descriptor of the `admin` kind.
pub static ADMIN_PLUGIN: PluginDescriptor = PluginDescriptor {
    api_version: CHORUS_PLUGIN_API_VERSION,
    kind: "admin",
    description: "Host-admin commands: reload, enable, disable, stats, broadcast",
    create: || Arc::new(AdminPlugin),
};

/// Broadcasts are paced, so they get a longer deadline than other handlers.
const ADMIN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// The host-admin plugin.
pub struct AdminPlugin;

#[async_trait]
impl Plugin for AdminPlugin {
    fn manifest(&self) -> Manifest {
        Manifest::new("admin", env!("CARGO_PKG_VERSION"))
            .category("host")
            .description("Host administration")
            .commands(["reload", "enable", "disable", "stats", "broadcast"])
            .admin_only()
            .timeout(ADMIN_TIMEOUT)
    }

    async fn handle(&self, ctx: &PluginContext) -> HandlerResult {
        let host = ctx.host()?;
        let command = ctx.command().unwrap_or_default();
        let args = ctx.args();

        let reply = match command {
            "reload" => match host.reload().await {
                Ok(report) => format!(
                    "🔄 Reloaded: {} new, {} changed, {} unchanged, {} removed, {} failed",
                    report.loaded.len(),
                    report.reloaded.len(),
                    report.unchanged.len(),
                    report.removed.len(),
                    report.failed.len() + report.rejected.len(),
                ),
                Err(e) => format!("❌ Reload failed: {e}"),
            },
            "enable" | "disable" => {
                let Some(target) = args.first() else {
                    ctx.reply(format!("Usage: {}{command} <plugin>", ctx.settings().prefix))
                        .await?;
                    return Ok(());
                };
                let result = if command == "enable" {
                    host.enable(target)
                } else {
                    host.disable(target)
                };
                match result {
                    Ok(()) => format!("✅ {target} {command}d"),
                    Err(e) => format!("❌ {e}"),
                }
            }
            "stats" => serde_json::to_string_pretty(&host.stats())?,
            "broadcast" => {
                let text = args.join(" ");
                if text.trim().is_empty() {
                    ctx.reply(format!("Usage: {}broadcast <text>", ctx.settings().prefix))
                        .await?;
                    return Ok(());
                }
                info!(sender = ?ctx.sender(), "Broadcast requested");
                let report = host.broadcast(&text).await;
                format!(
                    "📣 Broadcast sent to {} chats ({} failed)",
                    report.delivered,
                    report.failed.len()
                )
            }
            other => format!("Unknown admin command: {other}"),
        };

        ctx.reply(reply).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chorus_core::Jid;
    use chrono::Utc;
    use serde_json::Value;

    use super::*;
    use crate::context::Origin;
    use crate::context::tests::{services, text_message};
    use crate::host::HostHandle;
    use crate::plugin::{InlineSource, PluginCatalog, PluginFile};
    use crate::registry::PluginRegistry;

    const OWNER: &str = "2348099999999";

    async fn run(registry: &Arc<PluginRegistry>, text: &str) {
        let host = Arc::new(HostHandle::new(Arc::clone(registry), Duration::ZERO, Utc::now()));
        let ctx = PluginContext::new(
            Arc::from("admin"),
            Origin::Message(Arc::new(text_message(OWNER, OWNER, text))),
            Arc::new(Value::Null),
            Arc::clone(registry.services()),
        )
        .with_host(host);
        AdminPlugin.handle(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_disable_and_enable_round_trip() {
        let (services, client) = services().await;
        let registry = Arc::new(PluginRegistry::new(
            PluginCatalog::new().with(&ADMIN_PLUGIN),
            Arc::new(InlineSource::new(vec![
                PluginFile::new("00-admin.toml", "admin"),
                PluginFile::new("10-second.toml", "admin").named("second").with_overrides(
                    crate::plugin::ManifestOverrides {
                        commands: Some(vec!["noop".into()]),
                        ..Default::default()
                    },
                ),
            ])),
            services,
        ));
        registry.load_all().await.unwrap();

        run(&registry, ".disable second").await;
        assert!(!registry.snapshot().is_enabled("second"));
        assert!(registry.resolve("noop").is_none());

        run(&registry, ".enable second").await;
        assert!(registry.snapshot().is_enabled("second"));

        run(&registry, ".disable ghost").await;
        let replies = client.sent_texts(&Jid::parse(OWNER).unwrap());
        assert_eq!(replies[0], "✅ second disabled");
        assert_eq!(replies[1], "✅ second enabled");
        assert!(replies[2].starts_with("❌"));
    }

    #[tokio::test]
    async fn test_stats_replies_with_json() {
        let (services, client) = services().await;
        let registry = Arc::new(PluginRegistry::new(
            PluginCatalog::new().with(&ADMIN_PLUGIN),
            Arc::new(InlineSource::new(vec![PluginFile::new("00-admin.toml", "admin")])),
            services,
        ));
        registry.load_all().await.unwrap();

        run(&registry, ".stats").await;
        let reply = client.sent_texts(&Jid::parse(OWNER).unwrap()).remove(0);
        let stats: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(stats["plugins"][0]["name"], "admin");
    }

    #[tokio::test]
    async fn test_broadcast_without_text_prints_usage() {
        let (services, client) = services().await;
        let registry = Arc::new(PluginRegistry::new(
            PluginCatalog::new(),
            Arc::new(InlineSource::default()),
            services,
        ));
        run(&registry, ".broadcast").await;
        assert_eq!(
            client.sent_texts(&Jid::parse(OWNER).unwrap()),
            vec!["Usage: .broadcast <text>".to_string()]
        );
    }
}
