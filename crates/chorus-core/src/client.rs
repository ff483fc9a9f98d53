//! The chat-protocol client capability.
//!
//! The host never speaks the wire protocol itself; it consumes a
//! [`ChatClient`] that owns the session, yields inbound events and
//! connection transitions, and performs outbound calls.
//!
//! [`MemoryChatClient`] is an in-process implementation that records every
//! outbound message and lets callers inject inbound traffic. It backs the
//! test suites and the console demo.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{ClientError, ClientResult};
use crate::identifier::Jid;
use crate::message::{MessageRef, RawMessage};

// =============================================================================
// Connection state
// =============================================================================

/// Observed state of the protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No session.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Session established and healthy.
    Connected,
    /// Session up but unreliable (e.g. keepalive misses).
    Degraded,
}

impl ConnectionState {
    /// Returns `true` only for [`ConnectionState::Connected`].
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns the lowercase name of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the client's event stream yields.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// An inbound protocol message or notification.
    Inbound(RawMessage),
    /// A connection-state transition.
    Connection(ConnectionState),
}

// =============================================================================
// Outbound payloads
// =============================================================================

/// Where media bytes come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    /// Fetched by the client from a URL.
    Url(String),
    /// Inline bytes.
    Bytes(Vec<u8>),
}

/// An outbound message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundPayload {
    /// Text with optional mentions.
    Text {
        /// Body.
        text: String,
        /// Users to mention.
        #[serde(default)]
        mentions: Vec<Jid>,
    },
    /// Image with optional caption.
    Image {
        /// Image data.
        media: MediaSource,
        /// Caption.
        caption: Option<String>,
        /// Users to mention in the caption.
        #[serde(default)]
        mentions: Vec<Jid>,
    },
    /// Document attachment.
    Document {
        /// Document data.
        media: MediaSource,
        /// File name shown to recipients.
        file_name: String,
        /// MIME type.
        mime_type: String,
        /// Caption.
        caption: Option<String>,
    },
    /// Reaction to an existing message.
    Reaction {
        /// Message being reacted to.
        target: MessageRef,
        /// Emoji; empty removes the reaction.
        emoji: String,
    },
}

impl OutboundPayload {
    /// Creates a plain text payload.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            mentions: Vec::new(),
        }
    }

    /// Creates a text payload that mentions the given users.
    pub fn text_with_mentions(text: impl Into<String>, mentions: Vec<Jid>) -> Self {
        Self::Text {
            text: text.into(),
            mentions,
        }
    }

    /// Creates a reaction payload.
    pub fn reaction(target: MessageRef, emoji: impl Into<String>) -> Self {
        Self::Reaction {
            target,
            emoji: emoji.into(),
        }
    }

    /// Returns the text or caption carried by the payload, if any.
    pub fn text_content(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } => Some(text),
            Self::Image { caption, .. } | Self::Document { caption, .. } => caption.as_deref(),
            Self::Reaction { emoji, .. } => Some(emoji),
        }
    }
}

/// Per-send options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    /// Message to quote.
    pub quoted: Option<MessageRef>,
}

impl SendOptions {
    /// Quote the given message.
    pub fn quoting(target: MessageRef) -> Self {
        Self {
            quoted: Some(target),
        }
    }
}

/// Acknowledgement of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Destination chat.
    pub chat: Jid,
    /// Id assigned to the new message.
    pub id: String,
}

// =============================================================================
// Group metadata
// =============================================================================

/// Admin level of a group participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminRole {
    /// Group admin.
    Admin,
    /// Group creator.
    SuperAdmin,
}

/// One member of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Normalized participant id.
    pub id: Jid,
    /// Admin flag, if any.
    pub admin: Option<AdminRole>,
}

/// Group subject and participant list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    /// Group id.
    pub id: Jid,
    /// Group subject line.
    pub subject: String,
    /// Current participants.
    pub participants: Vec<Participant>,
}

impl GroupMetadata {
    /// Returns `true` when `user` is an admin or super-admin of the group.
    pub fn is_admin(&self, user: &Jid) -> bool {
        self.participants
            .iter()
            .any(|p| p.admin.is_some() && p.id.bare_number() == user.bare_number())
    }

    /// Returns `true` when `user` is a participant.
    pub fn contains(&self, user: &Jid) -> bool {
        self.participants
            .iter()
            .any(|p| p.id.bare_number() == user.bare_number())
    }
}

/// Block list action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAction {
    /// Block the user.
    Block,
    /// Unblock the user.
    Unblock,
}

// =============================================================================
// ChatClient
// =============================================================================

/// The capability through which the host talks to the messaging service.
#[async_trait]
pub trait ChatClient: Send + Sync + 'static {
    /// The identity of the logged-in session, once known.
    fn host_identity(&self) -> Option<Jid>;

    /// Current connection state.
    fn connection_state(&self) -> ConnectionState;

    /// Hands out the event stream. Only the first caller receives it.
    fn take_events(&self) -> Option<mpsc::Receiver<ClientEvent>>;

    /// Establishes the session.
    async fn connect(&self) -> ClientResult<()>;

    /// Sends a message to a chat.
    async fn send_message(
        &self,
        chat: &Jid,
        payload: OutboundPayload,
        options: SendOptions,
    ) -> ClientResult<SentMessage>;

    /// Downloads the media attached to a message.
    async fn download_media(&self, message: &MessageRef) -> ClientResult<Vec<u8>>;

    /// Fetches group metadata.
    async fn group_metadata(&self, chat: &Jid) -> ClientResult<GroupMetadata>;

    /// Fetches metadata for every group the session participates in.
    async fn group_fetch_all_participating(&self) -> ClientResult<Vec<GroupMetadata>>;

    /// Blocks or unblocks a user.
    async fn update_block_status(&self, user: &Jid, action: BlockAction) -> ClientResult<()>;

    /// Changes the profile display name.
    async fn update_profile_name(&self, name: &str) -> ClientResult<()>;

    /// Changes the profile status line.
    async fn update_profile_status(&self, status: &str) -> ClientResult<()>;

    /// Closes the session.
    async fn close(&self) -> ClientResult<()>;
}

/// Type alias for a shared chat client.
pub type BoxedChatClient = Arc<dyn ChatClient>;

// =============================================================================
// MemoryChatClient
// =============================================================================

/// A message recorded by [`MemoryChatClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    /// Destination chat.
    pub chat: Jid,
    /// Payload as sent.
    pub payload: OutboundPayload,
    /// Send options.
    pub options: SendOptions,
}

impl OutboundRecord {
    /// Returns the text or caption of the recorded payload.
    pub fn text(&self) -> &str {
        self.payload.text_content().unwrap_or_default()
    }
}

/// An in-process [`ChatClient`].
pub struct MemoryChatClient {
    identity: Jid,
    state: Mutex<ConnectionState>,
    events_tx: mpsc::Sender<ClientEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ClientEvent>>>,
    outbound: Mutex<Vec<OutboundRecord>>,
    outbound_tx: mpsc::UnboundedSender<OutboundRecord>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<OutboundRecord>>>,
    groups: Mutex<HashMap<Jid, GroupMetadata>>,
    media: Mutex<HashMap<String, Vec<u8>>>,
    blocked: Mutex<Vec<Jid>>,
    profile: Mutex<(String, String)>,
    metadata_calls: AtomicUsize,
    next_id: AtomicUsize,
}

impl MemoryChatClient {
    /// Default capacity of the inbound event channel.
    const EVENT_BUFFER: usize = 1024;

    /// Creates a disconnected client for the given host identity.
    pub fn new(identity: Jid) -> Self {
        let (events_tx, events_rx) = mpsc::channel(Self::EVENT_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            identity,
            state: Mutex::new(ConnectionState::Disconnected),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            outbound: Mutex::new(Vec::new()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            groups: Mutex::new(HashMap::new()),
            media: Mutex::new(HashMap::new()),
            blocked: Mutex::new(Vec::new()),
            profile: Mutex::new((String::new(), String::new())),
            metadata_calls: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Queues an inbound message on the event stream.
    pub async fn inject(&self, raw: RawMessage) -> ClientResult<()> {
        self.events_tx
            .send(ClientEvent::Inbound(raw))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Moves to `state` and announces the transition on the event stream.
    pub async fn set_connection_state(&self, state: ConnectionState) -> ClientResult<()> {
        *self.state.lock() = state;
        debug!(state = %state, "Memory client connection state changed");
        self.events_tx
            .send(ClientEvent::Connection(state))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Registers group metadata served by [`ChatClient::group_metadata`].
    pub fn set_group(&self, metadata: GroupMetadata) {
        self.groups.lock().insert(metadata.id.clone(), metadata);
    }

    /// Registers media bytes served by [`ChatClient::download_media`].
    pub fn set_media(&self, message_id: impl Into<String>, bytes: Vec<u8>) {
        self.media.lock().insert(message_id.into(), bytes);
    }

    /// Returns a snapshot of every message sent so far.
    pub fn sent(&self) -> Vec<OutboundRecord> {
        self.outbound.lock().clone()
    }

    /// Returns the texts sent to `chat`, in order.
    pub fn sent_texts(&self, chat: &Jid) -> Vec<String> {
        self.outbound
            .lock()
            .iter()
            .filter(|r| &r.chat == chat)
            .map(|r| r.text().to_string())
            .collect()
    }

    /// Hands out a live feed of outbound messages. Only the first caller receives it.
    pub fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<OutboundRecord>> {
        self.outbound_rx.lock().take()
    }

    /// Number of metadata fetches served.
    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    /// Users currently blocked.
    pub fn blocked(&self) -> Vec<Jid> {
        self.blocked.lock().clone()
    }

    /// Current profile `(name, status)`.
    pub fn profile(&self) -> (String, String) {
        self.profile.lock().clone()
    }

    fn ensure_connected(&self) -> ClientResult<()> {
        let state = *self.state.lock();
        if state.is_healthy() {
            Ok(())
        } else {
            Err(ClientError::NotReady { state })
        }
    }
}

#[async_trait]
impl ChatClient for MemoryChatClient {
    fn host_identity(&self) -> Option<Jid> {
        Some(self.identity.clone())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn take_events(&self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.events_rx.lock().take()
    }

    async fn connect(&self) -> ClientResult<()> {
        self.set_connection_state(ConnectionState::Connecting).await?;
        self.set_connection_state(ConnectionState::Connected).await
    }

    async fn send_message(
        &self,
        chat: &Jid,
        payload: OutboundPayload,
        options: SendOptions,
    ) -> ClientResult<SentMessage> {
        self.ensure_connected()?;
        let record = OutboundRecord {
            chat: chat.clone(),
            payload,
            options,
        };
        trace!(chat = %chat, text = record.text(), "Memory client sent message");
        self.outbound.lock().push(record.clone());
        let _ = self.outbound_tx.send(record);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(SentMessage {
            chat: chat.clone(),
            id: format!("CHORUS{id:08X}"),
        })
    }

    async fn download_media(&self, message: &MessageRef) -> ClientResult<Vec<u8>> {
        self.media
            .lock()
            .get(&message.id)
            .cloned()
            .ok_or_else(|| ClientError::MediaUnavailable(message.id.clone()))
    }

    async fn group_metadata(&self, chat: &Jid) -> ClientResult<GroupMetadata> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        self.groups
            .lock()
            .get(chat)
            .cloned()
            .ok_or_else(|| ClientError::api(format!("unknown group {chat}")))
    }

    async fn group_fetch_all_participating(&self) -> ClientResult<Vec<GroupMetadata>> {
        Ok(self.groups.lock().values().cloned().collect())
    }

    async fn update_block_status(&self, user: &Jid, action: BlockAction) -> ClientResult<()> {
        self.ensure_connected()?;
        let mut blocked = self.blocked.lock();
        blocked.retain(|b| b != user);
        if action == BlockAction::Block {
            blocked.push(user.clone());
        }
        Ok(())
    }

    async fn update_profile_name(&self, name: &str) -> ClientResult<()> {
        self.ensure_connected()?;
        self.profile.lock().0 = name.to_string();
        Ok(())
    }

    async fn update_profile_status(&self, status: &str) -> ClientResult<()> {
        self.ensure_connected()?;
        self.profile.lock().1 = status.to_string();
        Ok(())
    }

    async fn close(&self) -> ClientResult<()> {
        *self.state.lock() = ConnectionState::Disconnected;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn client() -> MemoryChatClient {
        MemoryChatClient::new(Jid::parse("2348000000000").unwrap())
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let client = client();
        let chat = Jid::parse("2348012345678").unwrap();

        let err = assert_err!(
            client
                .send_message(&chat, OutboundPayload::text("hi"), SendOptions::default())
                .await
        );
        assert!(matches!(err, ClientError::NotReady { .. }));

        assert_ok!(client.connect().await);
        assert_ok!(
            client
                .send_message(&chat, OutboundPayload::text("hi"), SendOptions::default())
                .await
        );
        assert_eq!(client.sent_texts(&chat), vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn test_event_stream_carries_transitions() {
        let client = client();
        let mut events = client.take_events().unwrap();
        assert!(client.take_events().is_none());

        client.connect().await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::Connection(ConnectionState::Connecting))
        ));
        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::Connection(ConnectionState::Connected))
        ));
    }

    #[test]
    fn test_group_admin_lookup() {
        let admin = Jid::parse("2348012345678").unwrap();
        let member = Jid::parse("2348087654321").unwrap();
        let meta = GroupMetadata {
            id: Jid::parse("120363025246125486@g.us").unwrap(),
            subject: "test".into(),
            participants: vec![
                Participant {
                    id: admin.clone(),
                    admin: Some(AdminRole::Admin),
                },
                Participant {
                    id: member.clone(),
                    admin: None,
                },
            ],
        };
        assert!(meta.is_admin(&admin));
        assert!(!meta.is_admin(&member));
        assert!(meta.contains(&member));
    }
}
