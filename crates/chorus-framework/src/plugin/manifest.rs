//! Plugin manifests: the declarative half of a plugin.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chorus_core::{Jid, Message, MessageKind};

use crate::error::{RegistryError, RegistryResult};
use crate::gateway::IndexDecl;
use crate::scheduler::{Overlap, TaskSpec};

// ─── Trigger ─────────────────────────────────────────────────────────────────

/// A condition narrowing which non-command messages a passive plugin sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Text contains the substring (case-insensitive).
    Contains(String),
    /// Message is of this kind.
    Kind(MessageKind),
    /// Message mentions the host.
    Mention,
    /// Message quotes a message sent by the host.
    ReplyToHost,
}

impl Trigger {
    /// Returns `true` when `message` satisfies the trigger.
    pub fn matches(&self, message: &Message, host: Option<&Jid>) -> bool {
        match self {
            Self::Contains(needle) => message
                .text
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            Self::Kind(kind) => message.kind == *kind,
            Self::Mention => host.is_some_and(|h| {
                message
                    .mentions
                    .iter()
                    .any(|m| m.bare_number() == h.bare_number())
            }),
            Self::ReplyToHost => host.is_some_and(|h| {
                message
                    .quoted
                    .as_ref()
                    .and_then(|q| q.author.as_ref())
                    .is_some_and(|a| a.bare_number() == h.bare_number())
            }),
        }
    }
}

// ─── Manifest ────────────────────────────────────────────────────────────────

/// Declarative description of a plugin, immutable per load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    /// Unique plugin name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Grouping label for help listings.
    pub category: String,
    /// One-line description.
    pub description: String,
    /// Command tokens.
    pub commands: Vec<String>,
    /// Additional tokens routed to the same plugin.
    pub aliases: Vec<String>,
    /// Commands require the owner.
    pub owner_only: bool,
    /// Commands require a host admin.
    pub admin_only: bool,
    /// Commands only work in groups.
    pub group_only: bool,
    /// Per-user cooldown between command invocations.
    pub cooldown_ms: u64,
    /// Cron-driven tasks.
    pub scheduled_tasks: Vec<TaskSpec>,
    /// Receives non-command messages.
    pub passive: bool,
    /// Passive handler also sees the host's own messages.
    pub include_own_messages: bool,
    /// Narrows passive delivery; any match suffices.
    pub triggers: Vec<Trigger>,
    /// One invocation in flight at a time, in arrival order.
    pub serial: bool,
    /// Handler deadline override.
    pub timeout_ms: Option<u64>,
    /// Collection indexes the plugin needs.
    pub indexes: Vec<IndexDecl>,
}

impl Manifest {
    /// Starts a manifest.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    /// Sets the category.
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Sets the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds command tokens.
    pub fn commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.extend(commands.into_iter().map(Into::into));
        self
    }

    /// Adds alias tokens.
    pub fn aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    /// Restricts commands to the owner.
    pub fn owner_only(mut self) -> Self {
        self.owner_only = true;
        self
    }

    /// Restricts commands to host admins.
    pub fn admin_only(mut self) -> Self {
        self.admin_only = true;
        self
    }

    /// Restricts commands to groups.
    pub fn group_only(mut self) -> Self {
        self.group_only = true;
        self
    }

    /// Sets the per-user cooldown.
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_ms = cooldown.as_millis() as u64;
        self
    }

    /// Declares a scheduled task.
    pub fn task(mut self, task: TaskSpec) -> Self {
        self.scheduled_tasks.push(task);
        self
    }

    /// Subscribes to non-command messages.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Passive handler also sees the host's own messages.
    pub fn include_own_messages(mut self) -> Self {
        self.include_own_messages = true;
        self
    }

    /// Adds a passive trigger.
    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Runs invocations one at a time.
    pub fn serial(mut self) -> Self {
        self.serial = true;
        self
    }

    /// Overrides the handler deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Declares a collection index.
    pub fn index(mut self, index: IndexDecl) -> Self {
        self.indexes.push(index);
        self
    }

    /// Lowercased command and alias tokens, commands first, deduplicated.
    pub fn tokens(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.commands
            .iter()
            .chain(&self.aliases)
            .map(|t| t.trim().to_lowercase())
            .filter(|t| seen.insert(t.clone()))
            .collect()
    }

    /// The handler deadline override, if any.
    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// The per-user cooldown, if any.
    pub fn cooldown_duration(&self) -> Option<Duration> {
        (self.cooldown_ms > 0).then(|| Duration::from_millis(self.cooldown_ms))
    }

    /// Whether a non-command message reaches this plugin's passive handler.
    pub fn wants_passive(&self, message: &Message, host: Option<&Jid>) -> bool {
        if !self.passive {
            return false;
        }
        if message.is_from_host && !self.include_own_messages {
            return false;
        }
        self.triggers.is_empty() || self.triggers.iter().any(|t| t.matches(message, host))
    }

    /// Checks structural validity.
    pub fn validate(&self) -> RegistryResult<()> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::invalid_manifest("<unnamed>", "name must not be empty"));
        }
        if self.name.chars().any(char::is_whitespace) {
            return Err(RegistryError::invalid_manifest(
                &self.name,
                "name must not contain whitespace",
            ));
        }
        for token in self.commands.iter().chain(&self.aliases) {
            let token = token.trim();
            if token.is_empty() || token.chars().any(char::is_whitespace) {
                return Err(RegistryError::invalid_manifest(
                    &self.name,
                    format!("invalid command token '{token}'"),
                ));
            }
        }
        if self.timeout_ms == Some(0) {
            return Err(RegistryError::invalid_manifest(&self.name, "timeout_ms must be positive"));
        }
        Ok(())
    }
}

// ─── Overrides ───────────────────────────────────────────────────────────────

/// Per-task override from a plugin file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOverride {
    /// Replacement cron expression.
    pub cron: Option<String>,
    /// Replacement timezone.
    pub timezone: Option<String>,
    /// Replacement overlap policy.
    pub overlap: Option<Overlap>,
    /// Replacement deadline.
    pub timeout_ms: Option<u64>,
}

/// Operator adjustments applied on top of a plugin's own manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestOverrides {
    /// Replacement command list.
    pub commands: Option<Vec<String>>,
    /// Replacement alias list.
    pub aliases: Option<Vec<String>>,
    /// Replacement cooldown.
    pub cooldown_ms: Option<u64>,
    /// Replacement owner flag.
    pub owner_only: Option<bool>,
    /// Replacement admin flag.
    pub admin_only: Option<bool>,
    /// Replacement group flag.
    pub group_only: Option<bool>,
    /// Replacement serial flag.
    pub serial: Option<bool>,
    /// Replacement deadline.
    pub timeout_ms: Option<u64>,
    /// Per-task overrides keyed by task name.
    pub tasks: BTreeMap<String, TaskOverride>,
}

impl ManifestOverrides {
    /// Applies the overrides to `manifest`.
    pub fn apply(&self, mut manifest: Manifest) -> Manifest {
        if let Some(commands) = &self.commands {
            manifest.commands = commands.clone();
        }
        if let Some(aliases) = &self.aliases {
            manifest.aliases = aliases.clone();
        }
        if let Some(v) = self.cooldown_ms {
            manifest.cooldown_ms = v;
        }
        if let Some(v) = self.owner_only {
            manifest.owner_only = v;
        }
        if let Some(v) = self.admin_only {
            manifest.admin_only = v;
        }
        if let Some(v) = self.group_only {
            manifest.group_only = v;
        }
        if let Some(v) = self.serial {
            manifest.serial = v;
        }
        if self.timeout_ms.is_some() {
            manifest.timeout_ms = self.timeout_ms;
        }
        for task in &mut manifest.scheduled_tasks {
            let Some(o) = self.tasks.get(&task.name) else {
                continue;
            };
            if let Some(cron) = &o.cron {
                task.cron = cron.clone();
            }
            if o.timezone.is_some() {
                task.timezone = o.timezone.clone();
            }
            if let Some(overlap) = o.overlap {
                task.overlap = overlap;
            }
            if o.timeout_ms.is_some() {
                task.timeout_ms = o.timeout_ms;
            }
        }
        manifest
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chorus_core::{Chat, QuotedRef, RawMessage};
    use chrono::Utc;

    use super::*;

    fn message(text: &str, from_host: bool) -> Message {
        let chat = Chat::new(Jid::parse("2348011111111").unwrap());
        Message {
            id: "M1".into(),
            author: chat.id.clone(),
            chat,
            timestamp: Utc::now(),
            kind: MessageKind::Text,
            text: text.into(),
            mentions: vec![],
            quoted: None,
            reaction_target: None,
            reaction: None,
            is_from_host: from_host,
            command: None,
            args: vec![],
            push_name: None,
            raw: Arc::new(RawMessage::default()),
        }
    }

    #[test]
    fn test_tokens_are_case_folded_and_deduplicated() {
        let m = Manifest::new("economy", "1.0.0")
            .commands(["Balance", "bal"])
            .aliases(["BAL", "wallet"]);
        assert_eq!(m.tokens(), vec!["balance", "bal", "wallet"]);
    }

    #[test]
    fn test_validation() {
        assert!(Manifest::new("", "1").validate().is_err());
        assert!(Manifest::new("two words", "1").validate().is_err());
        assert!(Manifest::new("ok", "1").commands(["a b"]).validate().is_err());
        assert!(Manifest::new("ok", "1").commands(["ping"]).validate().is_ok());
    }

    #[test]
    fn test_passive_interest() {
        let host = Jid::parse("2348000000000").unwrap();
        let plain = Manifest::new("log", "1").passive();
        assert!(plain.wants_passive(&message("anything", false), Some(&host)));
        assert!(!plain.wants_passive(&message("own", true), Some(&host)));
        assert!(
            plain
                .clone()
                .include_own_messages()
                .wants_passive(&message("own", true), Some(&host))
        );

        let keyword = Manifest::new("hi", "1")
            .passive()
            .trigger(Trigger::Contains("Hello".into()));
        assert!(keyword.wants_passive(&message("well hello there", false), None));
        assert!(!keyword.wants_passive(&message("goodbye", false), None));

        let mut reply = message("sure", false);
        reply.quoted = Some(QuotedRef {
            id: "Q".into(),
            author: Some(host.clone()),
            text: String::new(),
            kind: MessageKind::Text,
        });
        let chatbot = Manifest::new("chat", "1")
            .passive()
            .trigger(Trigger::ReplyToHost);
        assert!(chatbot.wants_passive(&reply, Some(&host)));
        assert!(!chatbot.wants_passive(&message("sure", false), Some(&host)));

        assert!(!Manifest::new("cmd", "1").wants_passive(&message("x", false), None));
    }

    #[test]
    fn test_overrides_apply() {
        let base = Manifest::new("daily", "1")
            .commands(["daily"])
            .task(TaskSpec::new("reset", "0 0 * * *"));
        let mut overrides = ManifestOverrides {
            commands: Some(vec!["claim".into()]),
            cooldown_ms: Some(5_000),
            ..ManifestOverrides::default()
        };
        overrides.tasks.insert(
            "reset".into(),
            TaskOverride {
                cron: Some("0 6 * * *".into()),
                overlap: Some(Overlap::Queue),
                ..TaskOverride::default()
            },
        );

        let m = overrides.apply(base);
        assert_eq!(m.commands, vec!["claim"]);
        assert_eq!(m.cooldown_duration(), Some(Duration::from_secs(5)));
        assert_eq!(m.scheduled_tasks[0].cron, "0 6 * * *");
        assert_eq!(m.scheduled_tasks[0].overlap, Overlap::Queue);
    }
}
