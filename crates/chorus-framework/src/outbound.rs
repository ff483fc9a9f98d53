//! The single outbound gate in front of the chat client.
//!
//! Sends are serialised (one frame in flight on the shared connection) and
//! admitted only while the observed connection state is `Connected`. A
//! small bounded buffer absorbs bursts; when it is full, further sends fail
//! with [`ClientError::Busy`] instead of queueing without bound.

use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore, watch};
use tracing::trace;

use chorus_core::{
    BoxedChatClient, ClientError, ClientResult, ConnectionState, Jid, OutboundPayload,
    SendOptions, SentMessage,
};

/// Default number of sends that may wait for the connection.
pub const DEFAULT_BUFFER: usize = 32;

/// Serialising, health-aware wrapper around [`ChatClient::send_message`](chorus_core::ChatClient::send_message).
#[derive(Clone)]
pub struct OutboundGate {
    client: BoxedChatClient,
    state: watch::Receiver<ConnectionState>,
    buffer: Arc<Semaphore>,
    wire: Arc<Mutex<()>>,
}

impl OutboundGate {
    /// Creates a gate observing `state`.
    pub fn new(
        client: BoxedChatClient,
        state: watch::Receiver<ConnectionState>,
        buffer: usize,
    ) -> Self {
        Self {
            client,
            state,
            buffer: Arc::new(Semaphore::new(buffer.max(1))),
            wire: Arc::new(Mutex::new(())),
        }
    }

    /// The underlying client, for calls that are not sends.
    pub fn client(&self) -> &BoxedChatClient {
        &self.client
    }

    /// The last observed connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Sends one message.
    pub async fn send(
        &self,
        chat: &Jid,
        payload: OutboundPayload,
        options: SendOptions,
    ) -> ClientResult<SentMessage> {
        let state = self.state();
        if !state.is_healthy() {
            return Err(ClientError::NotReady { state });
        }
        let _permit = self
            .buffer
            .try_acquire()
            .map_err(|_| ClientError::Busy)?;

        let _wire = self.wire.lock().await;
        let state = self.state();
        if !state.is_healthy() {
            return Err(ClientError::NotReady { state });
        }
        trace!(chat = %chat, "Sending outbound message");
        self.client.send_message(chat, payload, options).await
    }
}

impl std::fmt::Debug for OutboundGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundGate")
            .field("state", &self.state())
            .field("available", &self.buffer.available_permits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chorus_core::{ChatClient, MemoryChatClient};
    use tokio_test::assert_err;

    use super::*;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_sends_require_connected_state() {
        let client = Arc::new(MemoryChatClient::new(jid("2348000000000")));
        client.connect().await.unwrap();
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        let gate = OutboundGate::new(client.clone(), rx, DEFAULT_BUFFER);
        let chat = jid("2348011111111");

        let err = gate
            .send(&chat, OutboundPayload::text("hi"), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::NotReady {
                state: ConnectionState::Disconnected
            }
        ));

        tx.send(ConnectionState::Connected).unwrap();
        gate.send(&chat, OutboundPayload::text("hi"), SendOptions::default())
            .await
            .unwrap();

        tx.send(ConnectionState::Degraded).unwrap();
        assert_err!(
            gate.send(&chat, OutboundPayload::text("again"), SendOptions::default())
                .await
        );
        assert_eq!(client.sent_texts(&chat), vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn test_full_buffer_reports_busy() {
        let client = Arc::new(MemoryChatClient::new(jid("2348000000000")));
        client.connect().await.unwrap();
        let (_tx, rx) = watch::channel(ConnectionState::Connected);
        let gate = OutboundGate::new(client, rx, 1);

        let held = gate.buffer.clone().try_acquire_owned().unwrap();
        let err = gate
            .send(&jid("2348011111111"), OutboundPayload::text("hi"), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Busy));
        drop(held);
    }
}
