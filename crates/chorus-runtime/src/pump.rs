//! The event pump: client stream to dispatcher.
//!
//! Inbound messages are classified and queued on a per-chat lane so that
//! admission happens in arrival order within each chat while different
//! chats proceed concurrently. A lane worker exits after sitting idle;
//! the next message for that chat starts a fresh one.
//!
//! Connection transitions are published on the health channel (which the
//! scheduler and the outbound gate observe) and on the `connection` bus
//! topic. Protocol notifications invalidate cached group metadata and go
//! out on the `host_event` topic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use chorus_core::{ClientEvent, ConnectionState, Jid, Message};
use chorus_framework::{Classified, Classifier, Dispatcher, HostEvent, HostServices};

/// Lane workers exit after this long without a message.
pub const LANE_IDLE: Duration = Duration::from_secs(30);

/// Bus topic for connection transitions.
pub const CONNECTION_TOPIC: &str = "connection";

/// Bus topic for protocol notifications.
pub const HOST_EVENT_TOPIC: &str = "host_event";

/// Publisher name used for host-originated bus messages.
const HOST_PUBLISHER: &str = "host";

type Lanes = Arc<Mutex<HashMap<Jid, mpsc::UnboundedSender<Message>>>>;

/// Drives classification and per-chat ordered dispatch.
pub struct EventPump {
    classifier: Classifier,
    dispatcher: Dispatcher,
    services: Arc<HostServices>,
    health: watch::Sender<ConnectionState>,
    lanes: Lanes,
    tracker: TaskTracker,
    idle: Duration,
}

impl EventPump {
    /// Creates a pump.
    pub fn new(
        classifier: Classifier,
        dispatcher: Dispatcher,
        health: watch::Sender<ConnectionState>,
    ) -> Self {
        let services = Arc::clone(dispatcher.registry().services());
        Self {
            classifier,
            dispatcher,
            services,
            health,
            lanes: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
            idle: LANE_IDLE,
        }
    }

    /// Overrides how long an idle lane lingers.
    pub fn with_lane_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    /// Number of chats with a live lane.
    pub fn active_lanes(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Consumes `events` until the stream ends or `cancel` fires, then
    /// waits for queued messages to be admitted.
    pub async fn run(&self, mut events: mpsc::Receiver<ClientEvent>, cancel: CancellationToken) {
        info!("Event pump started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(ClientEvent::Connection(state)) => self.on_connection(state),
                Some(ClientEvent::Inbound(raw)) => {
                    match self.classifier.classify(raw, Utc::now()) {
                        Classified::Message(message) => self.enqueue(message),
                        Classified::Event(event) => self.on_host_event(event),
                        Classified::Ignored(reason) => trace!(reason, "Ignored inbound event"),
                    }
                }
                None => {
                    warn!("Client event stream closed");
                    break;
                }
            }
        }

        // Dropping the senders lets every lane drain and exit.
        self.lanes.lock().clear();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Event pump stopped");
    }

    fn on_connection(&self, state: ConnectionState) {
        let previous = self.health.send_replace(state);
        if previous == state {
            return;
        }
        match state {
            ConnectionState::Connected => {
                if let Some(host) = self.services.gate.client().host_identity() {
                    self.services.permissions.set_host_identity(host);
                }
                info!(from = %previous, "Connected");
            }
            ConnectionState::Connecting => debug!(from = %previous, "Connecting"),
            ConnectionState::Degraded | ConnectionState::Disconnected => {
                warn!(from = %previous, to = %state, "Connection lost or degraded");
            }
        }
        self.services.bus.publish(
            CONNECTION_TOPIC,
            HOST_PUBLISHER,
            json!({ "from": previous, "to": state }),
        );
    }

    fn on_host_event(&self, event: HostEvent) {
        if let Some(group) = event.stale_group() {
            self.services.permissions.invalidate(group);
        }
        debug!(?event, "Host event");
        match serde_json::to_value(&event) {
            Ok(payload) => {
                self.services
                    .bus
                    .publish(HOST_EVENT_TOPIC, HOST_PUBLISHER, payload);
            }
            Err(e) => warn!(error = %e, "Cannot encode host event"),
        }
    }

    fn enqueue(&self, message: Message) {
        let chat = message.chat.id.clone();
        let mut lanes = self.lanes.lock();
        let message = match lanes.get(&chat) {
            Some(lane) => match lane.send(message) {
                Ok(()) => return,
                // The worker went idle between our lookup and the send.
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(message);
        lanes.insert(chat.clone(), tx);
        drop(lanes);

        trace!(%chat, "Opened chat lane");
        self.tracker.spawn(lane_worker(
            chat,
            rx,
            self.dispatcher.clone(),
            Arc::clone(&self.lanes),
            self.idle,
        ));
    }
}

async fn lane_worker(
    chat: Jid,
    mut rx: mpsc::UnboundedReceiver<Message>,
    dispatcher: Dispatcher,
    lanes: Lanes,
    idle: Duration,
) {
    loop {
        match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(message)) => {
                let id = message.id.clone();
                let admission = dispatcher.dispatch(message).await;
                trace!(message_id = %id, ?admission, "Admitted");
            }
            Ok(None) => break,
            Err(_) => {
                // Sends happen under the same lock, so an empty queue here
                // means nothing can be lost by retiring the lane.
                let mut lanes = lanes.lock();
                if rx.is_empty() {
                    lanes.remove(&chat);
                    break;
                }
            }
        }
    }
    trace!(%chat, "Closed chat lane");
}
