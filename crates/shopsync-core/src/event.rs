//! Event bus for shopsync using tokio::broadcast
//!
//! Every push-channel event goes through this single dispatch path: the
//! channel publishes, the client and UI consumers subscribe. Handlers live on
//! the bus, not on a connection, so they survive reconnects.

use crate::channel::ChannelState;
use shopsync_types::{MessageRecord, RemoteNotificationItem};
use tokio::sync::broadcast;

/// Domain events pushed by the server (closed set)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    /// A new notification for the current user
    NotificationCreated(RemoteNotificationItem),
    /// Notification list changed server-side, refetch it
    NotificationsChanged,
    /// A chat/ticket message was stored
    MessageCreated {
        conversation_id: String,
        message: MessageRecord,
    },
    /// Support ticket status changed
    TicketUpdated { ticket_id: String, status: String },
    /// Catalog data under `scope` changed (e.g. "categories", "products")
    CatalogChanged { scope: String },
}

impl PushEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::NotificationCreated(_) => "notification_created",
            PushEvent::NotificationsChanged => "notifications_changed",
            PushEvent::MessageCreated { .. } => "message_created",
            PushEvent::TicketUpdated { .. } => "ticket_updated",
            PushEvent::CatalogChanged { .. } => "catalog_changed",
        }
    }
}

/// A push event together with the session it arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel session generation the frame was read from
    pub generation: u64,
    /// Identity the session was authenticated as
    pub identity: Option<String>,
    /// Room the server scoped the event to, if any
    pub room: Option<String>,
    pub event: PushEvent,
}

/// Everything the push channel reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Channel moved to a new state
    StateChanged(ChannelState),
    /// Handshake acknowledged
    Connected {
        generation: u64,
        identity: Option<String>,
    },
    /// Session ended
    Disconnected { generation: u64, reason: String },
    /// Transport or server-reported error
    Error { message: String },
    /// Domain event
    Push(Delivery),
}

/// Fan-out of channel events to every interested task.
///
/// Slow receivers lag and are told how many events they missed; the channel
/// never blocks on them.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChannelEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Bus sized for a storefront session (256 queued events)
    pub fn default_capacity() -> Self {
        Self::new(256)
    }

    pub fn publish(&self, event: ChannelEvent) {
        // Nobody listening yet is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.sender.subscribe()
    }

    /// Live receivers, including lagging ones
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::default_capacity()
    }
}
