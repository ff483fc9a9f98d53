//! The context handed to plugin hooks.
//!
//! Two types model what a plugin sees:
//!
//! - [`HostServices`] is the **shared** bundle of host services (outbound
//!   gate, store gateway, wallet, rate limiter, permissions, scheduler, bus,
//!   chat directory). One `Arc<HostServices>` is created at startup and
//!   cloned into every context.
//!
//! - [`PluginContext`] is built fresh for every dispatch. Its identifying
//!   fields (plugin name, origin, command, arguments) are read-only; its
//!   state map is isolated to that single invocation.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{Span, info_span};

use chorus_core::{
    BoxedChatClient, Chat, Jid, Message, OutboundPayload, SendOptions, SentMessage,
};

use crate::bus::{BusMessage, EventBus};
use crate::directory::ChatDirectory;
use crate::error::{ContextError, ContextResult};
use crate::gateway::CollectionsGateway;
use crate::host::HostControl;
use crate::outbound::OutboundGate;
use crate::permission::PermissionResolver;
use crate::rate_limit::RateLimiter;
use crate::scheduler::Scheduler;
use crate::wallet::Wallet;

// =============================================================================
// HostServices
// =============================================================================

/// Who the host answers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Everyone.
    #[default]
    Public,
    /// Host admins and the host itself.
    Private,
}

/// Host-wide settings visible to plugins.
#[derive(Debug, Clone)]
pub struct HostSettings {
    /// Command prefix.
    pub prefix: char,
    /// Access mode.
    pub mode: Mode,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            prefix: '.',
            mode: Mode::Public,
        }
    }
}

/// Services shared by every plugin.
pub struct HostServices {
    /// Serialised outbound sends.
    pub gate: OutboundGate,
    /// Safe store access.
    pub gateway: Arc<CollectionsGateway>,
    /// Shared per-user wallet.
    pub wallet: Arc<Wallet>,
    /// Cooldowns and windowed limits.
    pub rate_limiter: Arc<RateLimiter>,
    /// Role resolution.
    pub permissions: Arc<PermissionResolver>,
    /// Cron scheduler.
    pub scheduler: Scheduler,
    /// Cross-plugin publish/subscribe.
    pub bus: Arc<EventBus>,
    /// Chats seen since startup.
    pub directory: Arc<ChatDirectory>,
    /// Host-wide settings.
    pub settings: HostSettings,
}

impl fmt::Debug for HostServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostServices")
            .field("gate", &self.gate)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// PluginContext
// =============================================================================

/// Why a plugin hook is running.
#[derive(Debug, Clone)]
pub enum Origin {
    /// An inbound message (command or passive).
    Message(Arc<Message>),
    /// A scheduled task tick.
    Task(String),
    /// The plugin's init hook.
    Init,
}

/// Per-dispatch context.
///
/// ```rust,ignore
/// async fn handle(&self, ctx: &PluginContext) -> HandlerResult {
///     let cfg: MyConfig = ctx.config()?;
///     let user = ctx.sender().ok_or("no sender")?;
///     let balance = ctx.wallet().get_balance(&user.to_string()).await?;
///     ctx.reply(format!("{} {}", cfg.currency, balance.wallet)).await?;
///     Ok(())
/// }
/// ```
pub struct PluginContext {
    plugin: Arc<str>,
    origin: Origin,
    config: Arc<Value>,
    services: Arc<HostServices>,
    host: Option<Arc<dyn HostControl>>,
    state: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    span: Span,
}

impl PluginContext {
    /// Creates a context for `plugin` running because of `origin`.
    pub fn new(
        plugin: Arc<str>,
        origin: Origin,
        config: Arc<Value>,
        services: Arc<HostServices>,
    ) -> Self {
        let span = match &origin {
            Origin::Message(m) => info_span!(
                "plugin",
                plugin = %plugin,
                message_id = %m.id,
                chat = %m.chat,
                command = m.command.as_deref().unwrap_or(""),
            ),
            Origin::Task(task) => info_span!("plugin", plugin = %plugin, task = %task),
            Origin::Init => info_span!("plugin", plugin = %plugin, phase = "init"),
        };
        Self {
            plugin,
            origin,
            config,
            services,
            host: None,
            state: Mutex::new(HashMap::new()),
            span,
        }
    }

    /// Attaches the host control handle.
    pub fn with_host(mut self, host: Arc<dyn HostControl>) -> Self {
        self.host = Some(host);
        self
    }

    // ─── Identity ────────────────────────────────────────────────────────────

    /// Name of the plugin being invoked.
    pub fn plugin_name(&self) -> &str {
        &self.plugin
    }

    /// Why the hook is running.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// The inbound message, on the message path.
    pub fn message(&self) -> Option<&Message> {
        match &self.origin {
            Origin::Message(m) => Some(m),
            _ => None,
        }
    }

    /// The scheduled task name, on the task path.
    pub fn task(&self) -> Option<&str> {
        match &self.origin {
            Origin::Task(t) => Some(t),
            _ => None,
        }
    }

    /// The detected command token.
    pub fn command(&self) -> Option<&str> {
        self.message().and_then(|m| m.command.as_deref())
    }

    /// Command arguments.
    pub fn args(&self) -> &[String] {
        self.message().map_or(&[], |m| m.args.as_slice())
    }

    /// Message text (empty off the message path).
    pub fn text(&self) -> &str {
        self.message().map_or("", |m| m.text.as_str())
    }

    /// The originating chat.
    pub fn chat(&self) -> Option<&Chat> {
        self.message().map(|m| &m.chat)
    }

    /// The message author.
    pub fn sender(&self) -> Option<&Jid> {
        self.message().map(|m| &m.author)
    }

    /// The plugin-scoped span every hook runs in.
    pub fn span(&self) -> &Span {
        &self.span
    }

    // ─── Services ────────────────────────────────────────────────────────────

    /// All shared services.
    pub fn services(&self) -> &Arc<HostServices> {
        &self.services
    }

    /// The chat client, for calls other than sends.
    pub fn client(&self) -> &BoxedChatClient {
        self.services.gate.client()
    }

    /// Safe store access.
    pub fn store(&self) -> &Arc<CollectionsGateway> {
        &self.services.gateway
    }

    /// The shared wallet.
    pub fn wallet(&self) -> &Arc<Wallet> {
        &self.services.wallet
    }

    /// The shared rate limiter.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.services.rate_limiter
    }

    /// The permission resolver.
    pub fn permissions(&self) -> &Arc<PermissionResolver> {
        &self.services.permissions
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.services.scheduler
    }

    /// Host-wide settings.
    pub fn settings(&self) -> &HostSettings {
        &self.services.settings
    }

    /// Host control (reload, enable, broadcast).
    pub fn host(&self) -> ContextResult<&Arc<dyn HostControl>> {
        self.host.as_ref().ok_or(ContextError::NoHostControl)
    }

    // ─── Outbound ────────────────────────────────────────────────────────────

    /// Replies in the originating chat, quoting the originating message.
    pub async fn reply(&self, text: impl Into<String>) -> ContextResult<SentMessage> {
        self.reply_with(OutboundPayload::text(text)).await
    }

    /// Replies with an arbitrary payload.
    pub async fn reply_with(&self, payload: OutboundPayload) -> ContextResult<SentMessage> {
        let message = self.message().ok_or(ContextError::NoOriginChat)?;
        let sent = self
            .services
            .gate
            .send(
                &message.chat.id,
                payload,
                SendOptions::quoting(message.reference()),
            )
            .await?;
        Ok(sent)
    }

    /// Reacts to the originating message.
    pub async fn react(&self, emoji: impl Into<String>) -> ContextResult<SentMessage> {
        let message = self.message().ok_or(ContextError::NoOriginChat)?;
        let sent = self
            .services
            .gate
            .send(
                &message.chat.id,
                OutboundPayload::reaction(message.reference(), emoji),
                SendOptions::default(),
            )
            .await?;
        Ok(sent)
    }

    /// Sends to any chat.
    pub async fn send(&self, chat: &Jid, payload: OutboundPayload) -> ContextResult<SentMessage> {
        let sent = self
            .services
            .gate
            .send(chat, payload, SendOptions::default())
            .await?;
        Ok(sent)
    }

    // ─── Config ──────────────────────────────────────────────────────────────

    /// Deserialises the plugin's config section; an absent section yields
    /// `T::default()`.
    pub fn config<T: DeserializeOwned + Default>(&self) -> ContextResult<T> {
        if self.config.is_null() {
            return Ok(T::default());
        }
        Ok(T::deserialize(self.config.as_ref())?)
    }

    /// The raw config section.
    pub fn raw_config(&self) -> &Arc<Value> {
        &self.config
    }

    // ─── Bus ─────────────────────────────────────────────────────────────────

    /// Publishes on the event bus as this plugin.
    pub fn publish(&self, topic: &str, payload: Value) -> usize {
        self.services.bus.publish(topic, &self.plugin, payload)
    }

    /// Subscribes to a bus topic.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.services.bus.subscribe(topic)
    }

    // ─── Per-dispatch state ──────────────────────────────────────────────────

    /// Stores a value for the rest of this invocation. One value per type.
    pub fn set_state<T: Send + Sync + 'static>(&self, value: T) {
        self.state.lock().insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Retrieves a clone of a stored value.
    pub fn get_state<T: Clone + 'static>(&self) -> Option<T> {
        self.state
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Returns `true` if a value of type `T` is stored.
    pub fn has_state<T: 'static>(&self) -> bool {
        self.state.lock().contains_key(&TypeId::of::<T>())
    }

    /// Removes and returns a stored value.
    pub fn take_state<T: 'static>(&self) -> Option<T> {
        self.state
            .lock()
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin", &self.plugin)
            .field("origin", &self.origin)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chorus_core::{ChatClient, ConnectionState, MemoryChatClient, MemoryStore, RawMessage};
    use chrono::Utc;
    use tokio::sync::watch;

    use super::*;
    use crate::classifier::{Classified, Classifier};
    use crate::gateway::GatewayConfig;
    use crate::scheduler::{DEFAULT_TIMEZONE, HostClock};
    use crate::wallet::WalletConfig;

    pub(crate) const HOST: &str = "2348000000000";

    /// Services over in-memory backends with a connected client.
    pub(crate) async fn services() -> (Arc<HostServices>, Arc<MemoryChatClient>) {
        let client = Arc::new(MemoryChatClient::new(Jid::parse(HOST).unwrap()));
        client.connect().await.unwrap();
        let (_tx, health) = watch::channel(ConnectionState::Connected);
        let gateway = Arc::new(CollectionsGateway::new(
            Arc::new(MemoryStore::new()),
            GatewayConfig::default(),
        ));
        let services = Arc::new(HostServices {
            gate: OutboundGate::new(client.clone(), health.clone(), 8),
            wallet: Arc::new(Wallet::new(gateway.clone(), WalletConfig::default())),
            gateway,
            rate_limiter: Arc::new(RateLimiter::default()),
            permissions: Arc::new(PermissionResolver::new(
                client.clone(),
                Some(Jid::parse("2348099999999").unwrap()),
                vec![],
            )),
            scheduler: Scheduler::new(health, DEFAULT_TIMEZONE, HostClock::system()),
            bus: Arc::new(EventBus::new()),
            directory: Arc::new(ChatDirectory::new()),
            settings: HostSettings::default(),
        });
        (services, client)
    }

    /// A classified text message from `author` in `chat`.
    pub(crate) fn text_message(chat: &str, author: &str, text: &str) -> Message {
        let participant = chat.ends_with("@g.us").then_some(author);
        let raw: RawMessage = serde_json::from_value(serde_json::json!({
            "key": {
                "remoteJid": chat,
                "fromMe": false,
                "id": format!("M{}", text.len()),
                "participant": participant,
            },
            "messageTimestamp": 1_700_000_000,
            "message": { "conversation": text }
        }))
        .unwrap();
        match Classifier::new('.', Some(Jid::parse(HOST).unwrap())).classify(raw, Utc::now()) {
            Classified::Message(m) => m,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default)]
    struct GreetConfig {
        greeting: String,
        times: u32,
    }

    #[tokio::test]
    async fn test_reply_quotes_origin() {
        let (services, client) = services().await;
        let msg = text_message("2348011111111", "2348011111111", ".ping");
        let ctx = PluginContext::new(
            Arc::from("ping"),
            Origin::Message(Arc::new(msg.clone())),
            Arc::new(Value::Null),
            services,
        );

        assert_eq!(ctx.command(), Some("ping"));
        ctx.reply("pong").await.unwrap();

        let sent = client.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text(), "pong");
        assert_eq!(sent[0].chat, msg.chat.id);
        assert_eq!(sent[0].options.quoted.as_ref().unwrap().id, msg.id);
    }

    #[tokio::test]
    async fn test_reply_outside_message_path_fails() {
        let (services, client) = services().await;
        let ctx = PluginContext::new(
            Arc::from("daily"),
            Origin::Task("reset".into()),
            Arc::new(Value::Null),
            services.clone(),
        );
        assert_eq!(ctx.task(), Some("reset"));
        assert!(matches!(ctx.reply("x").await, Err(ContextError::NoOriginChat)));
        assert!(matches!(ctx.host(), Err(ContextError::NoHostControl)));

        let init = PluginContext::new(Arc::from("daily"), Origin::Init, Arc::new(Value::Null), services);
        assert!(matches!(init.react("👍").await, Err(ContextError::NoOriginChat)));
        assert!(client.sent().is_empty());
    }

    #[tokio::test]
    async fn test_typed_config() {
        let (services, _client) = services().await;
        let ctx = PluginContext::new(
            Arc::from("greet"),
            Origin::Init,
            Arc::new(serde_json::json!({ "greeting": "hey" })),
            services.clone(),
        );
        let cfg: GreetConfig = ctx.config().unwrap();
        assert_eq!(cfg.greeting, "hey");
        assert_eq!(cfg.times, 0);

        let empty = PluginContext::new(Arc::from("greet"), Origin::Init, Arc::new(Value::Null), services.clone());
        assert_eq!(empty.config::<GreetConfig>().unwrap(), GreetConfig::default());

        let wrong = PluginContext::new(
            Arc::from("greet"),
            Origin::Init,
            Arc::new(serde_json::json!({ "times": "many" })),
            services,
        );
        assert!(matches!(wrong.config::<GreetConfig>(), Err(ContextError::Config(_))));
    }

    #[tokio::test]
    async fn test_state_is_per_context() {
        let (services, _client) = services().await;
        let a = PluginContext::new(Arc::from("a"), Origin::Init, Arc::new(Value::Null), services.clone());
        let b = PluginContext::new(Arc::from("b"), Origin::Init, Arc::new(Value::Null), services);

        a.set_state(42u32);
        assert_eq!(a.get_state::<u32>(), Some(42));
        assert!(!b.has_state::<u32>());
        assert_eq!(a.take_state::<u32>(), Some(42));
        assert!(!a.has_state::<u32>());
    }

    #[tokio::test]
    async fn test_publish_carries_plugin_name() {
        let (services, _client) = services().await;
        let ctx = PluginContext::new(Arc::from("economy"), Origin::Init, Arc::new(Value::Null), services);
        let mut rx = ctx.subscribe("economy.level_up");
        assert_eq!(ctx.publish("economy.level_up", serde_json::json!({ "level": 2 })), 1);
        let msg = rx.recv().await.unwrap();
        assert_eq!(&*msg.from, "economy");
    }
}
