//! Message model.
//!
//! [`RawMessage`] mirrors the wire shape delivered by the protocol client
//! (camelCase keys, a free-form `message` payload). [`Message`] is the typed
//! record produced by the event classifier and handed to plugins.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identifier::Jid;

// =============================================================================
// Raw protocol shapes
// =============================================================================

/// The addressing block of a raw protocol message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    /// Chat the message belongs to.
    pub remote_jid: String,
    /// Whether the host session sent it.
    #[serde(default)]
    pub from_me: bool,
    /// Protocol message id.
    pub id: String,
    /// Author inside a group chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
}

/// A raw inbound event as delivered by the chat client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    /// Addressing block.
    pub key: MessageKey,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub message_timestamp: Option<i64>,
    /// Sender display name.
    #[serde(default)]
    pub push_name: Option<String>,
    /// Payload object keyed by message type (`conversation`, `imageMessage`, ...).
    #[serde(default)]
    pub message: Option<Value>,
    /// Protocol notification type for system events (`GROUP_PARTICIPANT_ADD`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_stub_type: Option<String>,
    /// Parameters of a protocol notification (usually the affected users).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_stub_parameters: Vec<String>,
}

// =============================================================================
// Chat
// =============================================================================

/// Whether a chat is one-to-one or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    /// One-to-one conversation.
    Direct,
    /// Group conversation.
    Group,
}

/// A conversation the host participates in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chat {
    /// Normalized chat identifier.
    pub id: Jid,
    /// Direct or group.
    pub kind: ChatKind,
}

impl Chat {
    /// Builds a chat, deriving its kind from the identifier's server.
    pub fn new(id: Jid) -> Self {
        let kind = if id.is_group() {
            ChatKind::Group
        } else {
            ChatKind::Direct
        };
        Self { id, kind }
    }

    /// Returns `true` for group chats.
    pub fn is_group(&self) -> bool {
        self.kind == ChatKind::Group
    }
}

impl fmt::Display for Chat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}

// =============================================================================
// Message
// =============================================================================

/// The classified type of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain or extended text.
    Text,
    /// Image, possibly captioned.
    Image,
    /// Video, possibly captioned.
    Video,
    /// Sticker.
    Sticker,
    /// Audio or push-to-talk note.
    Voice,
    /// Document, possibly captioned.
    Document,
    /// Poll creation or vote.
    Poll,
    /// Protocol notification or anything unrecognised.
    System,
    /// Emoji reaction to another message.
    Reaction,
}

impl MessageKind {
    /// Maps a payload key to a kind.
    pub fn from_payload_key(key: &str) -> Self {
        match key {
            "conversation" | "extendedTextMessage" | "buttonsResponseMessage"
            | "listResponseMessage" | "templateButtonReplyMessage" => Self::Text,
            "imageMessage" => Self::Image,
            "videoMessage" | "ptvMessage" => Self::Video,
            "stickerMessage" => Self::Sticker,
            "audioMessage" => Self::Voice,
            "documentMessage" | "documentWithCaptionMessage" => Self::Document,
            "pollCreationMessage" | "pollCreationMessageV3" | "pollUpdateMessage" => Self::Poll,
            "reactionMessage" => Self::Reaction,
            _ => Self::System,
        }
    }

    /// Returns the lowercase name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Sticker => "sticker",
            Self::Voice => "voice",
            Self::Document => "document",
            Self::Poll => "poll",
            Self::System => "system",
            Self::Reaction => "reaction",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pointer to a message in a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    /// Chat the message lives in.
    pub chat: Jid,
    /// Protocol message id.
    pub id: String,
    /// Author of the referenced message, when known.
    pub author: Option<Jid>,
    /// Whether the host sent the referenced message.
    pub from_host: bool,
}

/// The message a reply quotes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotedRef {
    /// Protocol id of the quoted message.
    pub id: String,
    /// Author of the quoted message.
    pub author: Option<Jid>,
    /// Extracted text of the quoted message.
    pub text: String,
    /// Kind of the quoted message.
    pub kind: MessageKind,
}

/// A classified inbound message.
///
/// Created on receipt, consumed by dispatch, never persisted by the host.
#[derive(Debug, Clone)]
pub struct Message {
    /// Protocol message id.
    pub id: String,
    /// Chat the message arrived in.
    pub chat: Chat,
    /// Normalized author.
    pub author: Jid,
    /// Send time reported by the protocol (or receipt time).
    pub timestamp: DateTime<Utc>,
    /// Classified kind.
    pub kind: MessageKind,
    /// Extracted body, caption or selection; empty for non-textual messages.
    pub text: String,
    /// Users mentioned in the message.
    pub mentions: Vec<Jid>,
    /// The quoted message, if this is a reply.
    pub quoted: Option<QuotedRef>,
    /// The target of a reaction.
    pub reaction_target: Option<MessageRef>,
    /// The emoji of a reaction (empty string removes a reaction).
    pub reaction: Option<String>,
    /// Whether the host identity authored the message.
    pub is_from_host: bool,
    /// Lowercased command token, when the text starts with the prefix.
    pub command: Option<String>,
    /// Whitespace-split arguments following the command.
    pub args: Vec<String>,
    /// Sender display name.
    pub push_name: Option<String>,
    /// The unmodified protocol event.
    pub raw: Arc<RawMessage>,
}

impl Message {
    /// Returns a reference to this message, suitable for quoting or reacting.
    pub fn reference(&self) -> MessageRef {
        MessageRef {
            chat: self.chat.id.clone(),
            id: self.id.clone(),
            author: Some(self.author.clone()),
            from_host: self.is_from_host,
        }
    }

    /// Returns `true` when a command was detected.
    pub fn is_command(&self) -> bool {
        self.command.is_some()
    }

    /// Returns `true` when the message was sent in a group.
    pub fn is_group(&self) -> bool {
        self.chat.is_group()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_message_deserializes_wire_shape() {
        let raw: RawMessage = serde_json::from_value(serde_json::json!({
            "key": {
                "remoteJid": "120363025246125486@g.us",
                "fromMe": false,
                "id": "3EB0C767D26A1D",
                "participant": "2348012345678:3@s.whatsapp.net"
            },
            "messageTimestamp": 1700000000,
            "pushName": "Ada",
            "message": { "conversation": "hi" }
        }))
        .unwrap();

        assert_eq!(raw.key.id, "3EB0C767D26A1D");
        assert_eq!(raw.push_name.as_deref(), Some("Ada"));
        assert!(raw.message_stub_type.is_none());
    }

    #[test]
    fn test_chat_kind_follows_server() {
        let group = Chat::new(Jid::parse("120363025246125486@g.us").unwrap());
        let direct = Chat::new(Jid::parse("2348012345678").unwrap());
        assert!(group.is_group());
        assert_eq!(direct.kind, ChatKind::Direct);
    }

    #[test]
    fn test_payload_key_mapping() {
        assert_eq!(MessageKind::from_payload_key("conversation"), MessageKind::Text);
        assert_eq!(MessageKind::from_payload_key("audioMessage"), MessageKind::Voice);
        assert_eq!(MessageKind::from_payload_key("somethingNew"), MessageKind::System);
    }
}
