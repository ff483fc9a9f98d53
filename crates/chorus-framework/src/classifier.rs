//! Event classification: raw protocol events to typed [`Message`]s.
//!
//! Classification is a pure function of the raw event, the configured
//! command prefix and the host identity. Protocol notifications (group
//! membership changes, calls) become [`HostEvent`]s for the runtime instead
//! of messages; anything unusable is [`Classified::Ignored`] with a reason.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use chorus_core::{
    Chat, Jid, Message, MessageKind, MessageRef, QuotedRef, RawMessage,
};

/// Payload keys that carry metadata rather than content.
const METADATA_KEYS: [&str; 3] = [
    "senderKeyDistributionMessage",
    "messageContextInfo",
    "protocolMessage",
];

/// Payload keys that wrap another payload under `.message`.
const WRAPPER_KEYS: [&str; 5] = [
    "ephemeralMessage",
    "viewOnceMessage",
    "viewOnceMessageV2",
    "viewOnceMessageV2Extension",
    "documentWithCaptionMessage",
];

/// Group membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantAction {
    /// Users joined or were added.
    Add,
    /// Users left or were removed.
    Remove,
    /// Users became admins.
    Promote,
    /// Users lost admin rights.
    Demote,
}

/// A protocol notification relevant to the host itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    /// Group membership or admin set changed.
    ParticipantsChanged {
        /// The group.
        chat: Jid,
        /// What happened.
        action: ParticipantAction,
        /// Affected users.
        participants: Vec<Jid>,
    },
    /// Group subject, description or settings changed.
    GroupChanged {
        /// The group.
        chat: Jid,
    },
    /// An incoming call notification.
    Call {
        /// Caller.
        from: Jid,
    },
}

impl HostEvent {
    /// The group whose cached metadata is now stale, if any.
    pub fn stale_group(&self) -> Option<&Jid> {
        match self {
            Self::ParticipantsChanged { chat, .. } | Self::GroupChanged { chat } => Some(chat),
            Self::Call { .. } => None,
        }
    }
}

/// The outcome of classifying one raw event.
#[derive(Debug, Clone)]
pub enum Classified {
    /// A message for the dispatcher.
    Message(Message),
    /// A notification for the runtime.
    Event(HostEvent),
    /// Nothing to do; the reason is for logs.
    Ignored(&'static str),
}

/// Classifies raw events.
#[derive(Debug, Clone)]
pub struct Classifier {
    prefix: char,
    host: Option<Jid>,
}

impl Classifier {
    /// Creates a classifier for the given prefix and host identity.
    pub fn new(prefix: char, host: Option<Jid>) -> Self {
        Self { prefix, host }
    }

    /// The command prefix.
    pub fn prefix(&self) -> char {
        self.prefix
    }

    /// Classifies one event. `received_at` stands in for a missing timestamp.
    pub fn classify(&self, raw: RawMessage, received_at: DateTime<Utc>) -> Classified {
        let Ok(chat_id) = Jid::parse(&raw.key.remote_jid) else {
            return Classified::Ignored("malformed chat id");
        };
        if chat_id.is_status() {
            return Classified::Ignored("status broadcast");
        }

        if let Some(stub) = raw.message_stub_type.as_deref() {
            return self.classify_stub(stub, chat_id, &raw);
        }

        let Some(payload) = raw.message.as_ref().map(unwrap_payload) else {
            return Classified::Ignored("empty payload");
        };
        let Some((kind_key, body)) = content_entry(payload) else {
            return Classified::Ignored("no content");
        };

        let chat = Chat::new(chat_id);
        let author = match self.author(&raw, &chat) {
            Some(author) => author,
            None => return Classified::Ignored("malformed author"),
        };
        let is_from_host = raw.key.from_me
            || self
                .host
                .as_ref()
                .is_some_and(|h| h.bare_number() == author.bare_number());

        let kind = MessageKind::from_payload_key(kind_key);
        let text = extract_text(payload);
        let context = body.get("contextInfo");
        let mentions = context
            .and_then(|c| c.get("mentionedJid"))
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .filter_map(|s| Jid::parse(s).ok())
                    .collect()
            })
            .unwrap_or_default();
        let quoted = context.and_then(quoted_ref);

        let (reaction_target, reaction) = if kind == MessageKind::Reaction {
            let target = body.get("key").and_then(|k| reaction_target(k, &chat));
            let emoji = body
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string);
            (target, emoji)
        } else {
            (None, None)
        };

        let (command, args) = if matches!(
            kind,
            MessageKind::Text | MessageKind::Image | MessageKind::Video | MessageKind::Document
        ) {
            self.detect_command(&text)
        } else {
            (None, Vec::new())
        };

        let timestamp = raw
            .message_timestamp
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or(received_at);

        Classified::Message(Message {
            id: raw.key.id.clone(),
            chat,
            author,
            timestamp,
            kind,
            text,
            mentions,
            quoted,
            reaction_target,
            reaction,
            is_from_host,
            command,
            args,
            push_name: raw.push_name.clone(),
            raw: Arc::new(raw),
        })
    }

    /// Splits `<prefix><command> <args...>`.
    pub fn detect_command(&self, text: &str) -> (Option<String>, Vec<String>) {
        let Some(rest) = text.trim_start().strip_prefix(self.prefix) else {
            return (None, Vec::new());
        };
        let mut tokens = rest.split_whitespace();
        match tokens.next() {
            Some(first) if rest.starts_with(first) => (
                Some(first.to_lowercase()),
                tokens.map(str::to_string).collect(),
            ),
            _ => (None, Vec::new()),
        }
    }

    fn author(&self, raw: &RawMessage, chat: &Chat) -> Option<Jid> {
        if raw.key.from_me
            && let Some(host) = &self.host
        {
            return Some(host.clone());
        }
        if chat.is_group() {
            raw.key
                .participant
                .as_deref()
                .and_then(|p| Jid::parse(p).ok())
        } else {
            Some(chat.id.clone())
        }
    }

    fn classify_stub(&self, stub: &str, chat: Jid, raw: &RawMessage) -> Classified {
        let participants = || {
            raw.message_stub_parameters
                .iter()
                .filter_map(|p| Jid::parse(p).ok())
                .collect::<Vec<_>>()
        };
        let action = match stub {
            "GROUP_PARTICIPANT_ADD" | "GROUP_PARTICIPANT_INVITE" | "GROUP_PARTICIPANT_ADD_REQUEST_JOIN" => {
                Some(ParticipantAction::Add)
            }
            "GROUP_PARTICIPANT_REMOVE" | "GROUP_PARTICIPANT_LEAVE" => Some(ParticipantAction::Remove),
            "GROUP_PARTICIPANT_PROMOTE" => Some(ParticipantAction::Promote),
            "GROUP_PARTICIPANT_DEMOTE" => Some(ParticipantAction::Demote),
            _ => None,
        };
        if let Some(action) = action {
            return Classified::Event(HostEvent::ParticipantsChanged {
                chat,
                action,
                participants: participants(),
            });
        }
        if stub.starts_with("GROUP_CHANGE_") || stub == "GROUP_CREATE" {
            return Classified::Event(HostEvent::GroupChanged { chat });
        }
        if stub.starts_with("CALL_MISSED_") {
            return Classified::Event(HostEvent::Call { from: chat });
        }
        Classified::Ignored("unhandled protocol notification")
    }
}

/// Strips wrapper layers (`ephemeralMessage`, `viewOnceMessage`, ...).
fn unwrap_payload(payload: &Value) -> &Value {
    let mut current = payload;
    loop {
        let inner = WRAPPER_KEYS
            .iter()
            .find_map(|k| current.get(*k).and_then(|w| w.get("message")));
        match inner {
            Some(next) => current = next,
            None => return current,
        }
    }
}

/// The first content key and its body.
fn content_entry(payload: &Value) -> Option<(&str, &Value)> {
    payload
        .as_object()?
        .iter()
        .find(|(k, _)| !METADATA_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.as_str(), v))
}

/// Text extraction precedence: plain text, extended text, media caption,
/// button display text, list selection.
fn extract_text(payload: &Value) -> String {
    let payload = unwrap_payload(payload);
    let str_at = |pointer: &str| payload.pointer(pointer).and_then(Value::as_str);

    str_at("/conversation")
        .or_else(|| str_at("/extendedTextMessage/text"))
        .or_else(|| str_at("/imageMessage/caption"))
        .or_else(|| str_at("/videoMessage/caption"))
        .or_else(|| str_at("/documentMessage/caption"))
        .or_else(|| str_at("/buttonsResponseMessage/selectedDisplayText"))
        .or_else(|| str_at("/templateButtonReplyMessage/selectedDisplayText"))
        .or_else(|| str_at("/listResponseMessage/singleSelectReply/selectedRowId"))
        .unwrap_or_default()
        .to_string()
}

fn quoted_ref(context: &Value) -> Option<QuotedRef> {
    let id = context.get("stanzaId")?.as_str()?.to_string();
    let author = context
        .get("participant")
        .and_then(Value::as_str)
        .and_then(|p| Jid::parse(p).ok());
    let (text, kind) = match context.get("quotedMessage") {
        Some(quoted) => {
            let kind = content_entry(unwrap_payload(quoted))
                .map_or(MessageKind::System, |(k, _)| MessageKind::from_payload_key(k));
            (extract_text(quoted), kind)
        }
        None => (String::new(), MessageKind::System),
    };
    Some(QuotedRef {
        id,
        author,
        text,
        kind,
    })
}

fn reaction_target(key: &Value, chat: &Chat) -> Option<MessageRef> {
    let id = key.get("id")?.as_str()?.to_string();
    let target_chat = key
        .get("remoteJid")
        .and_then(Value::as_str)
        .and_then(|j| Jid::parse(j).ok())
        .unwrap_or_else(|| chat.id.clone());
    let author = key
        .get("participant")
        .and_then(Value::as_str)
        .and_then(|p| Jid::parse(p).ok());
    Some(MessageRef {
        chat: target_chat,
        id,
        author,
        from_host: key.get("fromMe").and_then(Value::as_bool).unwrap_or(false),
    })
}
