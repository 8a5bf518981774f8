//! Sync client: the composition root
//!
//! Builds every service once, wires push events into the reconciler and the
//! message merger, and follows the auth module's identity signal.

use crate::auth::{Credential, IdentitySignal};
use crate::cache::{CacheConfig, ResponseCache};
use crate::channel::{ChannelConfig, Connector, PushChannel};
use crate::error::SyncResult;
use crate::event::{ChannelEvent, Delivery, EventBus, PushEvent};
use crate::fetch::{Backend, FetchConfig, Fetcher};
use crate::flags::FlagStore;
use crate::messages::{MergeOutcome, MergerConfig, MessageMerger};
use crate::notifications::NotificationCenter;
use crate::storage::StorageArea;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use shopsync_types::{MessageRecord, SenderRole};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Event the server expects for a chat/ticket message
pub const SEND_MESSAGE_EVENT: &str = "send_message";

/// Configuration for the sync client
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub cache: CacheConfig,
    pub fetch: FetchConfig,
    pub channel: ChannelConfig,
    pub merger: MergerConfig,

    /// Rooms joined as soon as the channel starts
    pub rooms: Vec<String>,

    /// Capacity of the channel event bus
    pub event_capacity: usize,
}

impl SyncConfig {
    pub fn new(channel: ChannelConfig) -> Self {
        Self {
            cache: CacheConfig::default(),
            fetch: FetchConfig::default(),
            channel,
            merger: MergerConfig::default(),
            rooms: Vec::new(),
            event_capacity: 256,
        }
    }
}

/// Per-user state and the identity it currently belongs to.
///
/// Deliveries are applied under the read lock and identity switches run
/// under the write lock, so nothing from the previous user lands after
/// the switch has wiped its state.
struct UserScope<B: Backend> {
    identity: RwLock<Option<String>>,
    fetcher: Arc<Fetcher<B>>,
    notifications: Arc<NotificationCenter>,
    messages: Arc<MessageMerger>,
}

impl<B: Backend> UserScope<B> {
    /// Hand the scope over to `credential`. Logging out also forgets the
    /// notification flags; a login keeps them.
    fn switch(&self, credential: Option<&Credential>) -> SyncResult<()> {
        let mut current = self.identity.write();
        *current = credential.map(|c| c.identity().to_string());
        self.fetcher.backend().set_credential(credential.cloned());
        match credential {
            Some(_) => {
                self.wipe_session();
                self.notifications.reset();
                Ok(())
            }
            None => self.wipe(),
        }
    }

    fn clear(&self) -> SyncResult<()> {
        let _current = self.identity.write();
        self.wipe()
    }

    fn wipe(&self) -> SyncResult<()> {
        self.wipe_session();
        self.notifications.clear()
    }

    // Cached responses and threads belong to whoever fetched them
    fn wipe_session(&self) {
        self.fetcher.cache().clear();
        self.messages.clear();
    }

    async fn dispatch(&self, delivery: Delivery) {
        let epoch = {
            let current = self.identity.read();
            if *current != delivery.identity {
                debug!(
                    generation = delivery.generation,
                    identity = ?delivery.identity,
                    event = delivery.event.name(),
                    "Dropping delivery for a previous identity"
                );
                return;
            }

            match delivery.event {
                PushEvent::NotificationsChanged => self.notifications.epoch(),
                PushEvent::NotificationCreated(item) => {
                    self.notifications.apply_created(item);
                    return;
                }
                PushEvent::MessageCreated {
                    conversation_id,
                    message,
                } => {
                    let outcome = self.messages.merge(&conversation_id, message);
                    if outcome != MergeOutcome::Appended {
                        debug!(conversation = %conversation_id, ?outcome, "Message echo merged");
                    }
                    return;
                }
                PushEvent::CatalogChanged { scope } => {
                    let dropped = self.fetcher.cache().invalidate_matching(&scope);
                    debug!(scope = %scope, dropped, "Catalog changed, cache invalidated");
                    return;
                }
                PushEvent::TicketUpdated { ticket_id, status } => {
                    debug!(ticket = %ticket_id, status = %status, "Ticket updated");
                    return;
                }
            }
        };

        if let Err(e) = self.notifications.refresh_at(epoch, &self.fetcher).await {
            warn!(error = %e, "Notification refresh failed");
        }
    }

    /// Refetch notifications on behalf of `identity`. Skipped if that
    /// identity is no longer current; dropped on arrival if it changes
    /// while the request is in flight.
    async fn refresh_as(&self, identity: &Option<String>) -> SyncResult<()> {
        let epoch = {
            let current = self.identity.read();
            if *current != *identity {
                return Ok(());
            }
            self.notifications.epoch()
        };
        self.notifications
            .refresh_at(epoch, &self.fetcher)
            .await
            .map(|_| ())
    }
}

/// Everything the storefront UI talks to
pub struct SyncClient<B: Backend> {
    cache: Arc<ResponseCache>,
    scope: Arc<UserScope<B>>,
    channel: PushChannel,
    bus: EventBus,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: Backend> SyncClient<B> {
    /// Construct the services and start the push channel
    pub fn start<C: Connector>(
        config: SyncConfig,
        backend: Arc<B>,
        connector: C,
        storage: Arc<dyn StorageArea>,
        identity: IdentitySignal,
    ) -> SyncResult<Self> {
        let credential = identity.borrow().clone();
        backend.set_credential(credential.clone());

        let cache = Arc::new(ResponseCache::new(config.cache));
        let scope = Arc::new(UserScope {
            identity: RwLock::new(credential.as_ref().map(|c| c.identity().to_string())),
            fetcher: Arc::new(Fetcher::new(backend, Arc::clone(&cache), config.fetch)),
            notifications: Arc::new(NotificationCenter::new(FlagStore::new(storage))),
            messages: Arc::new(MessageMerger::new(config.merger)),
        });
        let bus = EventBus::new(config.event_capacity);

        // Subscribe before the channel exists so no early event is missed
        let events = bus.subscribe();
        let channel = PushChannel::open(connector, config.channel, credential, bus.clone())?;
        for room in config.rooms {
            channel.join_room(room)?;
        }

        let client = Self {
            cache,
            scope,
            channel,
            bus,
            tasks: Mutex::new(Vec::new()),
        };

        let tasks = vec![
            client.spawn_dispatcher(events),
            client.spawn_identity_follower(identity),
            client.scope.notifications.spawn_cross_tab_sync(),
        ];
        *client.tasks.lock() = tasks;

        info!("Sync client started");
        Ok(client)
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn fetcher(&self) -> &Arc<Fetcher<B>> {
        &self.scope.fetcher
    }

    pub fn channel(&self) -> &PushChannel {
        &self.channel
    }

    pub fn notifications(&self) -> &Arc<NotificationCenter> {
        &self.scope.notifications
    }

    pub fn messages(&self) -> &Arc<MessageMerger> {
        &self.scope.messages
    }

    /// Identity the per-user state currently belongs to
    pub fn identity(&self) -> Option<String> {
        self.scope.identity.read().clone()
    }

    /// Lifecycle and domain events, for UI consumers
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.bus.subscribe()
    }

    /// Fetch the notification list and reconcile it
    pub async fn refresh_notifications(&self) -> SyncResult<()> {
        self.scope
            .notifications
            .refresh(&self.scope.fetcher)
            .await
            .map(|_| ())
    }

    /// Show a message right away and send it over the channel.
    ///
    /// The server is expected to echo `clientToken` back in
    /// `message_created`.
    pub fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        sender_name: &str,
    ) -> SyncResult<MessageRecord> {
        let record =
            self.scope
                .messages
                .send_local(conversation_id, content, SenderRole::Customer, sender_name);
        self.channel.emit(
            SEND_MESSAGE_EVENT,
            json!({
                "conversationId": conversation_id,
                "content": record.content,
                "clientToken": record.client_token,
            }),
        )?;
        Ok(record)
    }

    /// Drop every piece of per-user state: cached responses, messages,
    /// the notification list and both flag sets. Logout does the same.
    pub fn clear(&self) -> SyncResult<()> {
        self.scope.clear()
    }

    /// Stop background tasks and the push channel
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.channel.shutdown().await;
        info!("Sync client stopped");
    }

    fn spawn_dispatcher(&self, mut events: broadcast::Receiver<ChannelEvent>) -> JoinHandle<()> {
        let scope = Arc::clone(&self.scope);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChannelEvent::Push(delivery)) => scope.dispatch(delivery).await,
                    Ok(ChannelEvent::Connected {
                        generation,
                        identity: identity @ Some(_),
                    }) if generation > 1 => {
                        // Events may have been missed while disconnected
                        if let Err(e) = scope.refresh_as(&identity).await {
                            debug!(error = %e, "Notification refresh after reconnect failed");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Dispatcher lagged, refreshing notifications");
                        let identity = scope.identity.read().clone();
                        if let Err(e) = scope.refresh_as(&identity).await {
                            debug!(error = %e, "Notification refresh failed");
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_identity_follower(&self, mut identity: IdentitySignal) -> JoinHandle<()> {
        let scope = Arc::clone(&self.scope);
        let channel = self.channel.clone();

        tokio::spawn(async move {
            while identity.changed().await.is_ok() {
                let credential: Option<Credential> = identity.borrow_and_update().clone();
                let name = credential.as_ref().map(|c| c.identity().to_string());
                info!(identity = ?name, "Identity changed");

                if let Err(e) = scope.switch(credential.as_ref()) {
                    warn!(error = %e, "Failed to clear notification flags on logout");
                }

                if channel.set_credential(credential).is_err() {
                    break;
                }

                if name.is_some() {
                    if let Err(e) = scope.refresh_as(&name).await {
                        debug!(error = %e, "Notification refresh after login failed");
                    }
                }
            }
        })
    }
}
