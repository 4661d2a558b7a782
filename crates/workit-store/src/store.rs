use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use rand::Rng;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use workit_db::KeyValueStore;
use workit_types::events::StoreEvent;
use workit_types::models::{
    Attachment, AttachmentKind, Conversation, Message, Notification, TypingIndicator,
};

use crate::config::{ReplySimulation, StoreConfig};
use crate::error::StoreError;
use crate::persistence::{Persistence, Snapshot};
use crate::remote::{NewMessage, OutgoingAttachment, RemoteError, RemoteService};
use crate::scheduler::TaskRegistry;
use crate::seed::{CANNED_REPLIES, REPLY_NOTIFICATION, demo_dataset};

/// Ids minted on this device while the server was unreachable.
pub const LOCAL_ID_PREFIX: &str = "local_";

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

fn local_id(kind: &str) -> String {
    format!("{}{}_{}", LOCAL_ID_PREFIX, kind, Uuid::new_v4().simple())
}

/// Which source answered a load or refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Remote,
    LocalCache,
    Seeded,
}

/// In-memory conversations and messages for one signed-in user.
///
/// Cloning is cheap; all clones share the same session. Local state is
/// authoritative for the session: remote calls are attempted first where
/// they exist, but their failure never prevents a local mutation.
#[derive(Clone)]
pub struct MessageStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: StoreConfig,
    persistence: Persistence,
    remote: Option<Arc<dyn RemoteService>>,
    state: RwLock<SessionState>,
    tasks: Mutex<TaskRegistry>,
    events: broadcast::Sender<StoreEvent>,
    unread: watch::Sender<usize>,
}

#[derive(Default)]
struct SessionState {
    user_id: Option<String>,
    conversations: Vec<Conversation>,
    /// Keyed by conversation id, oldest first.
    messages: HashMap<String, Vec<Message>>,
    notifications: Vec<Notification>,
    /// Bumped on every persisted mutation; survives session changes.
    revision: u64,
}

impl SessionState {
    fn reset(&mut self, user_id: Option<String>) {
        self.user_id = user_id;
        self.conversations.clear();
        self.messages.clear();
        self.notifications.clear();
    }

    fn is_user(&self, user_id: &str) -> bool {
        self.user_id.as_deref() == Some(user_id)
    }

    fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    fn conversation_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    fn unread(&self) -> usize {
        let Some(user) = self.user_id.as_deref() else {
            return 0;
        };
        self.messages
            .values()
            .flatten()
            .filter(|m| m.is_unread_for(user))
            .count()
    }

    fn replace(&mut self, snapshot: Snapshot) {
        self.conversations = snapshot.conversations;
        self.messages = snapshot.messages;
        self.notifications = snapshot.notifications;
    }

    fn current(&self) -> Snapshot {
        Snapshot {
            conversations: self.conversations.clone(),
            messages: self.messages.clone(),
            notifications: self.notifications.clone(),
        }
    }

    /// Next revision plus the state to persist. Typing indicators are
    /// ephemeral and never written.
    fn commit(&mut self) -> (u64, Snapshot) {
        self.revision += 1;
        let mut snapshot = self.current();
        for conv in &mut snapshot.conversations {
            conv.is_typing = None;
        }
        (self.revision, snapshot)
    }
}

impl MessageStore {
    pub fn new(
        config: StoreConfig,
        kv: Arc<dyn KeyValueStore>,
        remote: Option<Arc<dyn RemoteService>>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (unread, _) = watch::channel(0);
        Self {
            inner: Arc::new(StoreInner {
                config,
                persistence: Persistence::new(kv),
                remote,
                state: RwLock::new(SessionState::default()),
                tasks: Mutex::new(TaskRegistry::default()),
                events,
                unread,
            }),
        }
    }

    /// Change feed for the UI.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    /// Unread count, updated after every mutation.
    pub fn subscribe_unread(&self) -> watch::Receiver<usize> {
        self.inner.unread.subscribe()
    }

    // -- Session lifecycle --

    /// Starts a session for `user_id`.
    ///
    /// Local storage is applied first so readers see something immediately,
    /// then the remote service is consulted; when neither has conversations
    /// the demo dataset is installed. Never fails.
    pub async fn load_for_user(&self, user_id: &str) -> Tier {
        let user_id = user_id.trim().to_string();
        self.inner.tasks.lock().await.cancel_all();
        self.inner.state.write().await.reset(Some(user_id.clone()));

        let mut tier = None;

        if let Some(local) = self.inner.persistence.load().await {
            let local = visible_to(local, &user_id);
            if !local.is_empty() {
                let mut state = self.inner.state.write().await;
                if state.is_user(&user_id) {
                    state.replace(local);
                    tier = Some(Tier::LocalCache);
                }
            }
        }

        if let Some(remote) = self.inner.remote.clone() {
            match fetch_snapshot(remote.as_ref(), &user_id).await {
                Ok(fetched) if !fetched.is_empty() => {
                    if self.apply_remote(&user_id, fetched).await {
                        tier = Some(Tier::Remote);
                    }
                }
                Ok(_) => debug!("Remote has no conversations for {}", user_id),
                Err(e) => warn!("Remote load failed, using local state: {}", e),
            }
        }

        let tier = match tier {
            Some(tier) => tier,
            None => {
                let commit = {
                    let mut state = self.inner.state.write().await;
                    if state.is_user(&user_id) {
                        state.replace(demo_dataset(&user_id, Utc::now()));
                        Some(state.commit())
                    } else {
                        None
                    }
                };
                if let Some((revision, snapshot)) = commit {
                    self.persist(revision, snapshot).await;
                }
                Tier::Seeded
            }
        };

        self.start_typing_ticker().await;

        let (conversations, unread) = {
            let state = self.inner.state.read().await;
            (state.conversations.len(), state.unread())
        };
        info!(
            "Loaded {} conversations for {} from {:?}",
            conversations, user_id, tier
        );
        self.emit(StoreEvent::Loaded { conversations });
        self.publish_unread(unread);
        tier
    }

    /// Re-fetches everything from the remote service. Unlike the mutators this
    /// reports remote failures to the caller.
    pub async fn refresh(&self) -> Result<Tier, StoreError> {
        let user_id = self.require_user().await?;
        let Some(remote) = self.inner.remote.clone() else {
            return Ok(Tier::LocalCache);
        };

        let fetched = fetch_snapshot(remote.as_ref(), &user_id).await?;
        if fetched.is_empty() {
            return Ok(Tier::LocalCache);
        }
        if !self.apply_remote(&user_id, fetched).await {
            return Err(StoreError::Authentication);
        }

        let (conversations, unread) = {
            let state = self.inner.state.read().await;
            (state.conversations.len(), state.unread())
        };
        self.emit(StoreEvent::Loaded { conversations });
        self.publish_unread(unread);
        Ok(Tier::Remote)
    }

    /// Ends the session: cancels every scheduled task and clears memory.
    /// Persisted state is left in place for the next session.
    pub async fn end_session(&self) {
        let cancelled = self.inner.tasks.lock().await.cancel_all();
        self.inner.state.write().await.reset(None);
        self.publish_unread(0);
        debug!("Session ended, {} scheduled tasks cancelled", cancelled);
    }

    pub async fn current_user(&self) -> Option<String> {
        self.inner.state.read().await.user_id.clone()
    }

    // -- Lookups --

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.inner.state.read().await.conversations.clone()
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.inner
            .state
            .read()
            .await
            .conversation(conversation_id)
            .cloned()
    }

    pub async fn get_conversation_messages(&self, conversation_id: &str) -> Vec<Message> {
        self.inner
            .state
            .read()
            .await
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn unread_count(&self) -> usize {
        self.inner.state.read().await.unread()
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.inner.state.read().await.notifications.clone()
    }

    // -- Mutators --

    /// Sends a message to the other participant of `conversation_id`.
    ///
    /// The message is appended locally whether or not the server accepted
    /// it; when it did not, it carries a local id and its files become
    /// `local://` references.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        attachments: Vec<OutgoingAttachment>,
    ) -> Result<Message, StoreError> {
        let user_id = self.require_user().await?;
        if conversation_id.trim().is_empty() {
            return Err(StoreError::Validation("conversation id is required".into()));
        }
        if content.trim().is_empty() && attachments.is_empty() {
            return Err(StoreError::Validation(
                "a message needs content or at least one attachment".into(),
            ));
        }

        let receiver_id = {
            let state = self.inner.state.read().await;
            let conv = state
                .conversation(conversation_id)
                .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conversation_id)))?;
            if !conv.has_participant(&user_id) {
                return Err(StoreError::Validation(format!(
                    "{} is not a participant of {}",
                    user_id, conversation_id
                )));
            }
            conv.counterpart(&user_id)
                .ok_or_else(|| {
                    StoreError::Validation(format!("{} has no other participant", conversation_id))
                })?
                .to_string()
        };

        let outgoing = NewMessage {
            content: content.to_string(),
            sender_id: user_id.clone(),
            receiver_id: receiver_id.clone(),
            attachments,
        };

        let message = match self.post_remote(conversation_id, &outgoing).await {
            Ok(message) => message,
            Err(e) => {
                warn!("Sending to {} failed, keeping message locally: {}", conversation_id, e);
                local_message(conversation_id, &outgoing)
            }
        };

        let (revision, snapshot, unread) = {
            let mut state = self.inner.state.write().await;
            // The conversation may have been deleted while the request was in flight
            let Some(conv) = state.conversation_mut(conversation_id) else {
                return Err(StoreError::NotFound(format!("conversation {}", conversation_id)));
            };
            conv.last_message = Some(Box::new(message.clone()));
            conv.last_activity = Some(message.timestamp);
            let was_typing = conv.is_typing.take().is_some();
            state
                .messages
                .entry(conversation_id.to_string())
                .or_default()
                .push(message.clone());
            if was_typing {
                self.emit(StoreEvent::TypingStop {
                    conversation_id: conversation_id.to_string(),
                });
            }
            let (revision, snapshot) = state.commit();
            (revision, snapshot, state.unread())
        };

        self.emit(StoreEvent::MessageCreate {
            message: message.clone(),
        });
        self.publish_unread(unread);
        self.persist(revision, snapshot).await;

        if let Some(sim) = self.inner.config.replies.clone() {
            self.schedule_reply(&sim, conversation_id, &receiver_id, &user_id)
                .await;
        }

        Ok(message)
    }

    /// Returns the id of the conversation between the current user and
    /// `participant_id`, creating it if needed.
    pub async fn create_conversation(
        &self,
        participant_id: &str,
        title: Option<&str>,
    ) -> Result<String, StoreError> {
        let user_id = self.require_user().await?;
        let participant_id = participant_id.trim();
        if participant_id.is_empty() {
            return Err(StoreError::Validation("participant id is required".into()));
        }
        if participant_id == user_id {
            return Err(StoreError::Validation(
                "cannot start a conversation with yourself".into(),
            ));
        }

        if let Some(existing) = self.find_pair(&user_id, participant_id).await {
            return Ok(existing);
        }

        let participants = vec![user_id.clone(), participant_id.to_string()];
        let title = title.map(str::trim).filter(|t| !t.is_empty());

        let created = match &self.inner.remote {
            Some(remote) => remote.create_conversation(&participants, title).await,
            None => Err(RemoteError::Status {
                status: 503,
                message: "no remote service configured".into(),
            }),
        };
        let conversation = match created {
            Ok(conv) => conv,
            Err(e) => {
                warn!("Creating conversation remotely failed, using a local one: {}", e);
                let now = Utc::now();
                Conversation {
                    id: local_id("conv"),
                    participants,
                    title: title.map(str::to_string),
                    last_message: None,
                    created_at: Some(now),
                    last_activity: Some(now),
                    is_typing: None,
                }
            }
        };

        let (revision, snapshot) = {
            let mut state = self.inner.state.write().await;
            if !state.is_user(&user_id) {
                return Err(StoreError::Authentication);
            }
            // Another call may have created it meanwhile
            if let Some(existing) = state
                .conversations
                .iter()
                .find(|c| c.id == conversation.id || c.is_between(&user_id, participant_id))
            {
                return Ok(existing.id.clone());
            }
            state.conversations.push(conversation.clone());
            state.messages.entry(conversation.id.clone()).or_default();
            state.commit()
        };

        info!("Conversation {} opened with {}", conversation.id, participant_id);
        let id = conversation.id.clone();
        self.emit(StoreEvent::ConversationCreate { conversation });
        self.persist(revision, snapshot).await;
        Ok(id)
    }

    /// Marks every message in the conversation addressed to the current user
    /// as read, along with the conversation's notifications. The server is
    /// told in the background; the local change does not wait for it.
    pub async fn mark_as_read(&self, conversation_id: &str) -> Result<usize, StoreError> {
        let user_id = self.require_user().await?;

        let (count, revision, snapshot, unread) = {
            let mut state = self.inner.state.write().await;
            let Some(messages) = state.messages.get_mut(conversation_id) else {
                return Ok(0);
            };
            let mut count = 0;
            for msg in messages.iter_mut().filter(|m| m.is_unread_for(&user_id)) {
                msg.is_read = true;
                count += 1;
            }
            for notif in state
                .notifications
                .iter_mut()
                .filter(|n| n.conversation_id == conversation_id && !n.is_read)
            {
                notif.is_read = true;
            }
            let (revision, snapshot) = state.commit();
            (count, revision, snapshot, state.unread())
        };

        if let Some(remote) = self.inner.remote.clone() {
            if !is_local_id(conversation_id) {
                let cid = conversation_id.to_string();
                let uid = user_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = remote.mark_read(&cid, &uid).await {
                        warn!("Remote mark-read for {} failed: {}", cid, e);
                    }
                });
            }
        }

        if count > 0 {
            self.emit(StoreEvent::MessagesRead {
                conversation_id: conversation_id.to_string(),
                count,
            });
        }
        self.publish_unread(unread);
        self.persist(revision, snapshot).await;
        Ok(count)
    }

    /// Removes the conversation, its messages and notifications, and cancels
    /// any reply still scheduled for it.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<bool, StoreError> {
        self.require_user().await?;

        let cancelled = self
            .inner
            .tasks
            .lock()
            .await
            .cancel_conversation(conversation_id);
        if cancelled > 0 {
            debug!("Cancelled {} pending tasks for {}", cancelled, conversation_id);
        }

        let (revision, snapshot, unread) = {
            let mut state = self.inner.state.write().await;
            let before = state.conversations.len();
            state.conversations.retain(|c| c.id != conversation_id);
            if state.conversations.len() == before {
                return Ok(false);
            }
            state.messages.remove(conversation_id);
            state
                .notifications
                .retain(|n| n.conversation_id != conversation_id);
            let (revision, snapshot) = state.commit();
            (revision, snapshot, state.unread())
        };

        info!("Deleted conversation {}", conversation_id);
        self.emit(StoreEvent::ConversationDelete {
            conversation_id: conversation_id.to_string(),
        });
        self.publish_unread(unread);
        self.persist(revision, snapshot).await;
        Ok(true)
    }

    /// Removes one message; the conversation's last-message snapshot falls
    /// back to the new tail.
    pub async fn delete_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        self.require_user().await?;

        let (revision, snapshot, unread) = {
            let mut state = self.inner.state.write().await;
            let Some(messages) = state.messages.get_mut(conversation_id) else {
                return Ok(false);
            };
            let before = messages.len();
            messages.retain(|m| m.id != message_id);
            if messages.len() == before {
                return Ok(false);
            }
            let tail = messages.last().cloned().map(Box::new);
            if let Some(conv) = state.conversation_mut(conversation_id) {
                conv.last_message = tail;
            }
            let (revision, snapshot) = state.commit();
            (revision, snapshot, state.unread())
        };

        self.emit(StoreEvent::MessageDelete {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
        });
        self.publish_unread(unread);
        self.persist(revision, snapshot).await;
        Ok(true)
    }

    /// Sets or clears the current user's typing indicator. Unknown
    /// conversations are ignored.
    pub async fn set_typing(&self, conversation_id: &str, typing: bool) -> Result<(), StoreError> {
        let user_id = self.require_user().await?;

        let event = {
            let mut state = self.inner.state.write().await;
            let Some(conv) = state.conversation_mut(conversation_id) else {
                return Ok(());
            };
            if typing {
                conv.is_typing = Some(TypingIndicator {
                    user_id: user_id.clone(),
                    timestamp: Utc::now(),
                });
                Some(StoreEvent::TypingStart {
                    conversation_id: conversation_id.to_string(),
                    user_id,
                })
            } else {
                conv.is_typing.take().map(|_| StoreEvent::TypingStop {
                    conversation_id: conversation_id.to_string(),
                })
            }
        };

        if let Some(event) = event {
            self.emit(event);
        }
        Ok(())
    }

    /// Clears typing indicators older than the configured timeout as of
    /// `now`. Returns how many were cleared.
    pub async fn expire_typing_at(&self, now: DateTime<Utc>) -> usize {
        let timeout = chrono::Duration::from_std(self.inner.config.typing_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));

        let expired: Vec<String> = {
            let mut state = self.inner.state.write().await;
            let mut expired = Vec::new();
            for conv in &mut state.conversations {
                let stale = conv
                    .is_typing
                    .as_ref()
                    .is_some_and(|t| now - t.timestamp > timeout);
                if stale {
                    conv.is_typing = None;
                    expired.push(conv.id.clone());
                }
            }
            expired
        };

        for conversation_id in &expired {
            self.emit(StoreEvent::TypingStop {
                conversation_id: conversation_id.clone(),
            });
        }
        expired.len()
    }

    pub async fn mark_notification_read(&self, notification_id: &str) -> Result<bool, StoreError> {
        self.require_user().await?;

        let (revision, snapshot) = {
            let mut state = self.inner.state.write().await;
            let Some(notif) = state
                .notifications
                .iter_mut()
                .find(|n| n.id == notification_id)
            else {
                return Ok(false);
            };
            if notif.is_read {
                return Ok(true);
            }
            notif.is_read = true;
            state.commit()
        };

        self.persist(revision, snapshot).await;
        Ok(true)
    }

    /// Number of scheduled replies still pending for a conversation.
    pub async fn pending_replies(&self, conversation_id: &str) -> usize {
        self.inner.tasks.lock().await.pending(conversation_id)
    }

    // -- Internals --

    async fn require_user(&self) -> Result<String, StoreError> {
        self.inner
            .state
            .read()
            .await
            .user_id
            .clone()
            .ok_or(StoreError::Authentication)
    }

    async fn find_pair(&self, user_id: &str, participant_id: &str) -> Option<String> {
        self.inner
            .state
            .read()
            .await
            .conversations
            .iter()
            .find(|c| c.is_between(user_id, participant_id))
            .map(|c| c.id.clone())
    }

    async fn post_remote(
        &self,
        conversation_id: &str,
        outgoing: &NewMessage,
    ) -> Result<Message, RemoteError> {
        let remote = match &self.inner.remote {
            Some(remote) if !is_local_id(conversation_id) => remote,
            _ => {
                return Err(RemoteError::Status {
                    status: 404,
                    message: "conversation is only known locally".into(),
                });
            }
        };
        remote.post_message(conversation_id, outgoing).await
    }

    /// Merges a fetched snapshot into the session. Returns false if the
    /// session changed hands while the fetch was running.
    async fn apply_remote(&self, user_id: &str, fetched: Snapshot) -> bool {
        let (revision, snapshot) = {
            let mut state = self.inner.state.write().await;
            if !state.is_user(user_id) {
                return false;
            }
            let merged = reconcile(state.current(), fetched);
            state.replace(merged);
            state.commit()
        };
        self.persist(revision, snapshot).await;
        true
    }

    async fn schedule_reply(
        &self,
        sim: &ReplySimulation,
        conversation_id: &str,
        from: &str,
        to: &str,
    ) {
        let Some((delay, text)) = roll_reply(sim) else {
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let cid = conversation_id.to_string();
        let from = from.to_string();
        let to = to.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                MessageStore { inner }
                    .deliver_reply(&cid, &from, &to, text)
                    .await;
            }
        });

        debug!("Reply for {} scheduled in {:?}", conversation_id, delay);
        self.inner
            .tasks
            .lock()
            .await
            .track_conversation(conversation_id, handle.abort_handle());
    }

    async fn deliver_reply(&self, conversation_id: &str, from: &str, to: &str, text: &str) {
        let now = Utc::now();
        let message = Message {
            id: local_id("msg"),
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            conversation_id: conversation_id.to_string(),
            content: text.to_string(),
            attachments: Vec::new(),
            timestamp: now,
            is_read: false,
        };

        let (revision, snapshot, unread) = {
            let mut state = self.inner.state.write().await;
            if !state.is_user(to) {
                return;
            }
            let Some(conv) = state.conversation_mut(conversation_id) else {
                return;
            };
            conv.last_message = Some(Box::new(message.clone()));
            conv.last_activity = Some(now);
            state
                .messages
                .entry(conversation_id.to_string())
                .or_default()
                .push(message.clone());
            state.notifications.push(Notification {
                id: local_id("notif"),
                conversation_id: conversation_id.to_string(),
                message: REPLY_NOTIFICATION.to_string(),
                sender: from.to_string(),
                timestamp: now,
                is_read: false,
            });
            let (revision, snapshot) = state.commit();
            (revision, snapshot, state.unread())
        };

        debug!("Simulated reply delivered to {}", conversation_id);
        self.emit(StoreEvent::MessageCreate { message });
        self.publish_unread(unread);
        self.persist(revision, snapshot).await;
    }

    async fn start_typing_ticker(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.typing_tick;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                MessageStore { inner }.expire_typing_at(Utc::now()).await;
            }
        });
        self.inner.tasks.lock().await.track_session(handle.abort_handle());
    }

    async fn persist(&self, revision: u64, snapshot: Snapshot) {
        if let Err(e) = self.inner.persistence.save(revision, &snapshot).await {
            warn!("Failed to persist message state: {:#}", e);
        }
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn publish_unread(&self, count: usize) {
        let changed = self.inner.unread.send_if_modified(|current| {
            if *current == count {
                false
            } else {
                *current = count;
                true
            }
        });
        if changed {
            self.emit(StoreEvent::UnreadCount { count });
        }
    }
}

/// Decides whether a reply happens, after how long, and with which text.
fn roll_reply(sim: &ReplySimulation) -> Option<(Duration, &'static str)> {
    let mut rng = rand::rng();
    if !rng.random_bool(sim.chance()) {
        return None;
    }
    let min = sim.min_delay.as_millis() as u64;
    let max = sim.max_delay.as_millis() as u64;
    let delay_ms = if max > min {
        rng.random_range(min..=max)
    } else {
        min
    };
    let text = CANNED_REPLIES[rng.random_range(0..CANNED_REPLIES.len())];
    Some((Duration::from_millis(delay_ms), text))
}

/// Fallback copy of a message the server did not accept.
fn local_message(conversation_id: &str, outgoing: &NewMessage) -> Message {
    let attachments = outgoing
        .attachments
        .iter()
        .map(|att| match att {
            OutgoingAttachment::File {
                name,
                content_type,
                data,
            } => Attachment {
                kind: AttachmentKind::from_content_type(content_type),
                url: format!("local://{}/{}", Uuid::new_v4().simple(), name),
                name: Some(name.clone()),
                size: Some(data.len() as u64),
                content_type: Some(content_type.clone()),
            },
            OutgoingAttachment::Link { url, name } => Attachment {
                kind: AttachmentKind::Link,
                url: url.clone(),
                name: name.clone(),
                size: None,
                content_type: None,
            },
        })
        .collect();

    Message {
        id: local_id("msg"),
        sender_id: outgoing.sender_id.clone(),
        receiver_id: outgoing.receiver_id.clone(),
        conversation_id: conversation_id.to_string(),
        content: outgoing.content.clone(),
        attachments,
        timestamp: Utc::now(),
        is_read: false,
    }
}

async fn fetch_snapshot(
    remote: &dyn RemoteService,
    user_id: &str,
) -> Result<Snapshot, RemoteError> {
    let mut conversations = remote.fetch_conversations(user_id).await?;
    conversations.retain(|c| c.has_participant(user_id));

    let histories =
        try_join_all(conversations.iter().map(|c| remote.fetch_messages(&c.id))).await?;

    let mut messages = HashMap::with_capacity(conversations.len());
    for (conv, history) in conversations.iter_mut().zip(histories) {
        conv.last_message = history.last().cloned().map(Box::new);
        messages.insert(conv.id.clone(), history);
    }

    Ok(Snapshot {
        conversations,
        messages,
        notifications: Vec::new(),
    })
}

/// Drops anything in a stored snapshot that does not belong to `user_id`
/// (the device may have been used by someone else).
fn visible_to(mut snapshot: Snapshot, user_id: &str) -> Snapshot {
    snapshot.conversations.retain(|c| c.has_participant(user_id));
    let ids: Vec<&str> = snapshot.conversations.iter().map(|c| c.id.as_str()).collect();
    snapshot.messages.retain(|id, _| ids.contains(&id.as_str()));
    snapshot
        .notifications
        .retain(|n| ids.contains(&n.conversation_id.as_str()));
    snapshot
}

/// Server data wins for everything it knows about. Conversations and
/// messages that only exist locally (created while offline) are carried
/// over, as are notifications for surviving conversations.
fn reconcile(local: Snapshot, mut remote: Snapshot) -> Snapshot {
    for conv in local.conversations {
        let known = remote.conversations.iter().any(|c| c.id == conv.id);
        if !known && is_local_id(&conv.id) {
            if let Some(history) = local.messages.get(&conv.id) {
                remote.messages.insert(conv.id.clone(), history.clone());
            }
            remote.conversations.push(conv);
        }
    }

    for (conversation_id, history) in &local.messages {
        let Some(merged) = remote.messages.get_mut(conversation_id) else {
            continue;
        };
        let mut touched = false;
        for msg in history.iter().filter(|m| is_local_id(&m.id)) {
            if !merged.iter().any(|m| m.id == msg.id) {
                merged.push(msg.clone());
                touched = true;
            }
        }
        if touched {
            merged.sort_by_key(|m| m.timestamp);
            let tail = merged.last().cloned().map(Box::new);
            if let Some(conv) = remote
                .conversations
                .iter_mut()
                .find(|c| &c.id == conversation_id)
            {
                conv.last_message = tail;
            }
        }
    }

    let ids: Vec<String> = remote.conversations.iter().map(|c| c.id.clone()).collect();
    remote.notifications = local
        .notifications
        .into_iter()
        .filter(|n| ids.contains(&n.conversation_id))
        .collect();
    remote
}
