//! Message admission and handler execution.
//!
//! [`Dispatcher::dispatch`] takes one classified message through:
//!
//! 1. **Mode gate**: in private mode, senders below host admin are dropped
//!    (the host's own messages always pass).
//! 2. **Global filters**: anti-link (groups) and anti-spam. On a match the
//!    configured template is sent and admission stops. Host admins and the
//!    host are exempt.
//! 3. **Command path**: the command index picks one plugin; its manifest
//!    flags are re-checked, then a per-user cooldown is taken. Failures
//!    answer with a template (the cooldown notice at most once per window).
//! 4. **Passive path**: unknown commands and plain messages go to every
//!    enabled passive plugin whose triggers match, in load order.
//!
//! Each admitted invocation runs on its own task with a deadline; errors,
//! panics and timeouts are contained, logged and counted. `serial` plugins
//! run through a FIFO lane with one invocation in flight.
//!
//! ```rust,ignore
//! let dispatcher = Dispatcher::new(registry, DispatchConfig::default());
//! services.scheduler.set_executor(Arc::new(dispatcher.clone()));
//! dispatcher.dispatch(message).await;
//! // …at shutdown…
//! dispatcher.drain(Duration::from_secs(10)).await;
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, trace, warn};

use chorus_core::{Message, OutboundPayload, SendOptions};

use crate::context::{HostServices, Mode, Origin, PluginContext};
use crate::host::HostControl;
use crate::permission::Requirement;
use crate::rate_limit;
use crate::registry::{LoadedPlugin, PluginRegistry};
use crate::scheduler::{TaskExecutor, TaskId};

/// Default handler deadline.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period for cancelled handlers to unwind after the drain deadline.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

// =============================================================================
// Configuration
// =============================================================================

/// Reply templates. `{secs}` in `cooldown` is replaced by the seconds left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Templates {
    /// Sent when a permission check fails.
    pub not_authorized: String,
    /// Sent once per window while a command is cooling down.
    pub cooldown: String,
    /// Sent when the anti-link filter removes a message.
    pub link_blocked: String,
    /// Sent when the anti-spam filter trips.
    pub spam_blocked: String,
}

impl Default for Templates {
    fn default() -> Self {
        Self {
            not_authorized: "⛔ You are not allowed to use this command.".into(),
            cooldown: "⏳ try again in {secs} s".into(),
            link_blocked: "🔗 Links are not allowed in this group.".into(),
            spam_blocked: "🚫 Slow down, you are sending messages too fast.".into(),
        }
    }
}

impl Templates {
    /// Renders the cooldown notice.
    pub fn cooldown_notice(&self, remaining: Duration) -> String {
        let secs = remaining.as_millis().div_ceil(1000);
        self.cooldown.replace("{secs}", &secs.to_string())
    }
}

/// Anti-spam window: at most `limit` messages per `window` per sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpamPolicy {
    /// Messages allowed per window.
    pub limit: u32,
    /// Window length.
    pub window: Duration,
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Default handler deadline.
    pub handler_timeout: Duration,
    /// Block links in groups.
    pub anti_link: bool,
    /// Per-sender message rate limit.
    pub anti_spam: Option<SpamPolicy>,
    /// Reply templates.
    pub templates: Templates,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            anti_link: false,
            anti_spam: None,
            templates: Templates::default(),
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// How one handler invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerOutcome {
    /// Returned `Ok`.
    Completed,
    /// Returned an error.
    Failed,
    /// Panicked.
    Panicked,
    /// Exceeded its deadline.
    TimedOut,
    /// Cancelled at shutdown.
    Cancelled,
    /// Not run (plugin gone or disabled).
    Skipped,
}

impl HandlerOutcome {
    /// Returns `true` for failures, panics and timeouts.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Panicked | Self::TimedOut)
    }
}

/// What admission decided for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Nothing ran.
    Dropped(&'static str),
    /// A global filter matched.
    Filtered(&'static str),
    /// The sender failed the command's permission check.
    Denied,
    /// The command is cooling down for this sender.
    Cooldown,
    /// The command handler was launched.
    Command(Arc<str>),
    /// This many passive handlers were launched.
    Passive(usize),
}

// =============================================================================
// Dispatcher
// =============================================================================

type Job = BoxFuture<'static, ()>;

struct Inner {
    registry: Arc<PluginRegistry>,
    services: Arc<HostServices>,
    config: DispatchConfig,
    host: OnceLock<Arc<dyn HostControl>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    lanes: Mutex<HashMap<Arc<str>, mpsc::UnboundedSender<Job>>>,
}

/// Routes messages and scheduled ticks to plugins. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Creates a dispatcher over `registry`.
    pub fn new(registry: Arc<PluginRegistry>, config: DispatchConfig) -> Self {
        let services = Arc::clone(registry.services());
        Self {
            inner: Arc::new(Inner {
                registry,
                services,
                config,
                host: OnceLock::new(),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
                lanes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Installs the host control handle exposed to plugins.
    pub fn set_host(&self, host: Arc<dyn HostControl>) {
        if self.inner.host.set(host).is_err() {
            warn!("Host control already set");
        }
    }

    /// The registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.inner.registry
    }

    /// Handler invocations (and serial lanes) currently alive.
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Admits one message and launches its handlers.
    ///
    /// Returns once the handlers are launched; it never waits for them.
    pub async fn dispatch(&self, message: Message) -> Admission {
        let inner = &self.inner;
        let services = &inner.services;
        services.directory.record(&message.chat);

        let privileged =
            message.is_from_host || services.permissions.is_host_admin(&message.author);

        if services.settings.mode == Mode::Private && !privileged {
            trace!(message_id = %message.id, "Dropped in private mode");
            return Admission::Dropped("private mode");
        }

        if !privileged && let Some(reason) = inner.filter(&message).await {
            return Admission::Filtered(reason);
        }

        let message = Arc::new(message);
        let snapshot = inner.registry.snapshot();

        if let Some(command) = message.command.as_deref()
            && let Some(plugin) = snapshot.resolve(command)
        {
            return Inner::admit_command(inner, Arc::clone(plugin), message).await;
        }

        let host = services.gate.client().host_identity();
        let mut launched = 0;
        for plugin in snapshot.passive() {
            if plugin.manifest.wants_passive(&message, host.as_ref()) {
                let deadline = plugin.deadline(inner.config.handler_timeout);
                // Passive invocations are fire-and-forget.
                drop(Inner::submit(
                    inner,
                    Arc::clone(plugin),
                    Origin::Message(Arc::clone(&message)),
                    deadline,
                ));
                launched += 1;
            }
        }
        if launched == 0 {
            return Admission::Dropped("no handler");
        }
        Admission::Passive(launched)
    }

    /// Waits up to `deadline` for in-flight handlers, then cancels the rest.
    ///
    /// Returns `true` when everything finished in time.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let inner = &self.inner;
        // Dropping the senders lets each lane finish its queue and exit.
        inner.lanes.lock().clear();
        inner.tracker.close();

        if tokio::time::timeout(deadline, inner.tracker.wait()).await.is_ok() {
            info!("Dispatcher drained");
            return true;
        }
        warn!(
            in_flight = inner.tracker.len(),
            "Drain deadline reached, cancelling remaining handlers"
        );
        inner.cancel.cancel();
        let _ = tokio::time::timeout(CANCEL_GRACE, inner.tracker.wait()).await;
        false
    }
}

impl Inner {
    async fn filter(&self, message: &Message) -> Option<&'static str> {
        let templates = &self.config.templates;
        if self.config.anti_link && message.is_group() && contains_link(&message.text) {
            info!(message_id = %message.id, chat = %message.chat, author = %message.author, "Link blocked");
            self.notify(message, &templates.link_blocked).await;
            return Some("anti-link");
        }
        if let Some(policy) = self.config.anti_spam {
            let key = rate_limit::key(message.author.bare_number(), "spam");
            let limiter = &self.services.rate_limiter;
            if limiter.is_limited(&key, policy.limit, policy.window) {
                info!(message_id = %message.id, author = %message.author, "Spam blocked");
                if limiter
                    .try_cooldown(&format!("notice:{key}"), policy.window)
                    .is_ok()
                {
                    self.notify(message, &templates.spam_blocked).await;
                }
                return Some("anti-spam");
            }
        }
        None
    }

    async fn admit_command(
        this: &Arc<Self>,
        plugin: Arc<LoadedPlugin>,
        message: Arc<Message>,
    ) -> Admission {
        let manifest = &plugin.manifest;
        let permissions = &this.services.permissions;

        let mut required = Vec::new();
        if manifest.owner_only {
            required.push(Requirement::Owner);
        }
        if manifest.admin_only {
            required.push(Requirement::HostAdmin);
        }
        if manifest.group_only {
            required.push(Requirement::Group);
        }
        for requirement in required {
            if let Err(e) = permissions
                .check_permission(requirement, &message.author, &message.chat)
                .await
            {
                debug!(plugin = %plugin.name, author = %message.author, error = %e, "Command denied");
                this.notify(&message, &this.config.templates.not_authorized)
                    .await;
                return Admission::Denied;
            }
        }

        if let Some(cooldown) = manifest.cooldown_duration() {
            let key = format!("cmd:{}:{}", plugin.name, message.author.bare_number());
            let limiter = &this.services.rate_limiter;
            if let Err(remaining) = limiter.try_cooldown(&key, cooldown) {
                debug!(plugin = %plugin.name, author = %message.author, "Command cooling down");
                if limiter
                    .try_cooldown(&format!("notice:{key}"), remaining)
                    .is_ok()
                {
                    let notice = this.config.templates.cooldown_notice(remaining);
                    this.notify(&message, &notice).await;
                }
                return Admission::Cooldown;
            }
        }

        let deadline = plugin.deadline(this.config.handler_timeout);
        let name = Arc::clone(&plugin.name);
        drop(Self::submit(this, plugin, Origin::Message(message), deadline));
        Admission::Command(name)
    }

    /// Sends a host notice quoting `message`; failures are only logged.
    async fn notify(&self, message: &Message, text: &str) {
        if let Err(e) = self
            .services
            .gate
            .send(
                &message.chat.id,
                OutboundPayload::text(text),
                SendOptions::quoting(message.reference()),
            )
            .await
        {
            warn!(chat = %message.chat, error = %e, "Failed to send notice");
        }
    }

    /// Launches one invocation, through the plugin's lane when serial.
    fn submit(
        this: &Arc<Self>,
        plugin: Arc<LoadedPlugin>,
        origin: Origin,
        deadline: Duration,
    ) -> oneshot::Receiver<HandlerOutcome> {
        let (tx, rx) = oneshot::channel();
        let serial = plugin.manifest.serial;
        let name = Arc::clone(&plugin.name);
        let inner = Arc::clone(this);
        let job: Job = Box::pin(async move {
            let outcome = inner.execute(plugin, origin, deadline).await;
            let _ = tx.send(outcome);
        });

        if serial {
            if let Err(mpsc::error::SendError(job)) = this.lane(&name).send(job) {
                warn!(plugin = %name, "Serial lane closed, running directly");
                this.tracker.spawn(job);
            }
        } else {
            this.tracker.spawn(job);
        }
        rx
    }

    fn lane(&self, plugin: &Arc<str>) -> mpsc::UnboundedSender<Job> {
        let mut lanes = self.lanes.lock();
        if let Some(lane) = lanes.get(plugin) {
            return lane.clone();
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let name = Arc::clone(plugin);
        self.tracker.spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            trace!(plugin = %name, "Serial lane closed");
        });
        lanes.insert(Arc::clone(plugin), tx.clone());
        tx
    }

    async fn execute(
        &self,
        plugin: Arc<LoadedPlugin>,
        origin: Origin,
        deadline: Duration,
    ) -> HandlerOutcome {
        let mut ctx = PluginContext::new(
            Arc::clone(&plugin.name),
            origin,
            Arc::clone(&plugin.config),
            Arc::clone(&self.services),
        );
        if let Some(host) = self.host.get() {
            ctx = ctx.with_host(Arc::clone(host));
        }
        let span = ctx.span().clone();
        let started = Instant::now();

        let outcome = async {
            let run = async {
                match ctx.origin() {
                    Origin::Task(task) => plugin.plugin.on_task(task, &ctx).await,
                    _ => plugin.plugin.handle(&ctx).await,
                }
            };
            let guarded = AssertUnwindSafe(run).catch_unwind();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!("Handler cancelled at shutdown");
                    HandlerOutcome::Cancelled
                }
                result = tokio::time::timeout(deadline, guarded) => match result {
                    Ok(Ok(Ok(()))) => HandlerOutcome::Completed,
                    Ok(Ok(Err(e))) => {
                        error!(error = %e, "Handler failed");
                        HandlerOutcome::Failed
                    }
                    Ok(Err(panic)) => {
                        error!(panic = %panic_message(panic.as_ref()), "Handler panicked");
                        HandlerOutcome::Panicked
                    }
                    Err(_) => {
                        warn!(deadline_ms = deadline.as_millis() as u64, "Handler timed out");
                        HandlerOutcome::TimedOut
                    }
                }
            }
        }
        .instrument(span)
        .await;

        let elapsed = started.elapsed();
        trace!(plugin = %plugin.name, ?outcome, elapsed_ms = elapsed.as_millis() as u64, "Handler finished");
        self.registry.record(&plugin.name, outcome, elapsed);
        outcome
    }
}

#[async_trait]
impl TaskExecutor for Dispatcher {
    async fn run_task(&self, task: &TaskId, timeout: Option<Duration>) -> HandlerOutcome {
        let snapshot = self.inner.registry.snapshot();
        let Some(plugin) = snapshot.get(&task.plugin).cloned() else {
            return HandlerOutcome::Skipped;
        };
        if !plugin.is_active() || !snapshot.is_enabled(&plugin.name) {
            return HandlerOutcome::Skipped;
        }
        let deadline = timeout.unwrap_or_else(|| plugin.deadline(self.inner.config.handler_timeout));
        Inner::submit(&self.inner, plugin, Origin::Task(task.task.clone()), deadline)
            .await
            .unwrap_or(HandlerOutcome::Cancelled)
    }
}

fn contains_link(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["http://", "https://", "www.", "chat.whatsapp.com/", "wa.me/"]
        .iter()
        .any(|marker| lower.contains(marker))
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}
