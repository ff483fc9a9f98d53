//! Chorus Core - foundation types for the Chorus chat automation host.
//!
//! This crate provides:
//! - Protocol identifiers and their normalization ([`Jid`])
//! - The inbound message model ([`RawMessage`], [`Message`])
//! - The chat-protocol capability ([`ChatClient`]) and an in-process
//!   implementation ([`MemoryChatClient`])
//! - The document store capability ([`Collections`]) with in-memory and
//!   file-backed implementations
//!
//! Nothing here knows about plugins; the host itself lives in
//! `chorus-framework`.

pub mod client;
pub mod error;
pub mod identifier;
pub mod message;
pub mod store;

pub use client::{
    AdminRole, BlockAction, BoxedChatClient, ChatClient, ClientEvent, ConnectionState,
    GroupMetadata, MediaSource, MemoryChatClient, OutboundPayload, OutboundRecord, Participant,
    SendOptions, SentMessage,
};
pub use error::{
    ClientError, ClientResult, IdentifierError, IdentifierResult, StoreError, StoreResult,
};
pub use identifier::{Jid, Server, normalize, same_user};
pub use message::{
    Chat, ChatKind, Message, MessageKey, MessageKind, MessageRef, QuotedRef, RawMessage,
};
pub use store::{
    BoxedCollections, Collection, Collections, FileStore, FindOptions, IndexSpec, MemoryStore,
    UpdateOptions, UpdateOutcome, WriteOp, open_store,
};
