use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

use workit_db::{KeyValueStore, MemoryKv};
use workit_store::seed::REPLY_NOTIFICATION;
use workit_store::{
    MessageStore, NewMessage, OutgoingAttachment, RemoteError, RemoteService, ReplySimulation,
    StoreConfig, StoreError, Tier, is_local_id,
};
use workit_types::events::StoreEvent;
use workit_types::models::{AttachmentKind, Conversation, Message};

/// In-process stand-in for the messaging API that can be switched off.
#[derive(Default)]
struct FakeRemote {
    online: AtomicBool,
    next_id: AtomicUsize,
    conversations: Mutex<Vec<Conversation>>,
    messages: Mutex<HashMap<String, Vec<Message>>>,
    mark_read_calls: Mutex<Vec<(String, String)>>,
}

impl FakeRemote {
    fn online() -> Arc<Self> {
        let remote = Self::default();
        remote.online.store(true, Ordering::SeqCst);
        Arc::new(remote)
    }

    fn offline() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), RemoteError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Status {
                status: 503,
                message: "offline".into(),
            })
        }
    }

    fn next(&self, kind: &str) -> String {
        format!("srv_{}_{}", kind, self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn add_conversation(&self, id: &str, participants: &[&str]) {
        self.conversations.lock().unwrap().push(Conversation {
            id: id.into(),
            participants: participants.iter().map(|p| p.to_string()).collect(),
            title: None,
            last_message: None,
            created_at: Some(Utc::now()),
            last_activity: Some(Utc::now()),
            is_typing: None,
        });
    }
}

#[async_trait]
impl RemoteService for FakeRemote {
    async fn fetch_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, RemoteError> {
        self.ensure_online()?;
        Ok(self
            .conversations
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.has_participant(user_id))
            .cloned()
            .collect())
    }

    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<Message>, RemoteError> {
        self.ensure_online()?;
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_conversation(
        &self,
        participants: &[String],
        title: Option<&str>,
    ) -> Result<Conversation, RemoteError> {
        self.ensure_online()?;
        let mut conversations = self.conversations.lock().unwrap();
        if let Some(existing) = conversations
            .iter()
            .find(|c| c.is_between(&participants[0], &participants[1]))
        {
            return Ok(existing.clone());
        }
        let conv = Conversation {
            id: self.next("conv"),
            participants: participants.to_vec(),
            title: title.map(str::to_string),
            last_message: None,
            created_at: Some(Utc::now()),
            last_activity: Some(Utc::now()),
            is_typing: None,
        };
        conversations.push(conv.clone());
        Ok(conv)
    }

    async fn post_message(
        &self,
        conversation_id: &str,
        message: &NewMessage,
    ) -> Result<Message, RemoteError> {
        self.ensure_online()?;
        let msg = Message {
            id: self.next("msg"),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            conversation_id: conversation_id.into(),
            content: message.content.clone(),
            attachments: Vec::new(),
            timestamp: Utc::now(),
            is_read: false,
        };
        self.messages
            .lock()
            .unwrap()
            .entry(conversation_id.into())
            .or_default()
            .push(msg.clone());
        Ok(msg)
    }

    async fn mark_read(&self, conversation_id: &str, user_id: &str) -> Result<(), RemoteError> {
        self.ensure_online()?;
        self.mark_read_calls
            .lock()
            .unwrap()
            .push((conversation_id.into(), user_id.into()));
        Ok(())
    }

    async fn unread_count(&self, _user_id: &str) -> Result<u64, RemoteError> {
        self.ensure_online()?;
        Ok(0)
    }
}

fn open_store(kv: &Arc<MemoryKv>, remote: Option<&Arc<FakeRemote>>) -> MessageStore {
    store_with(StoreConfig::default(), kv, remote)
}

fn store_with(
    config: StoreConfig,
    kv: &Arc<MemoryKv>,
    remote: Option<&Arc<FakeRemote>>,
) -> MessageStore {
    let remote = remote.map(|r| r.clone() as Arc<dyn RemoteService>);
    MessageStore::new(config, kv.clone(), remote)
}

fn always_reply() -> StoreConfig {
    StoreConfig {
        replies: Some(ReplySimulation {
            probability: 1.0,
            min_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(10),
        }),
        ..StoreConfig::default()
    }
}

#[tokio::test]
async fn mutators_require_a_session() {
    let kv = Arc::new(MemoryKv::new());
    let store = open_store(&kv, None);

    assert!(matches!(
        store.send_message("conv_1", "hi", Vec::new()).await,
        Err(StoreError::Authentication)
    ));
    assert!(matches!(
        store.create_conversation("bob", None).await,
        Err(StoreError::Authentication)
    ));
    assert!(matches!(
        store.mark_as_read("conv_1").await,
        Err(StoreError::Authentication)
    ));
    assert!(matches!(
        store.delete_conversation("conv_1").await,
        Err(StoreError::Authentication)
    ));
    assert!(store.conversations().await.is_empty());
    assert_eq!(store.unread_count().await, 0);
}

#[tokio::test]
async fn empty_sources_seed_demo_data_then_cache_it() {
    let kv = Arc::new(MemoryKv::new());
    let remote = FakeRemote::offline();

    let first = open_store(&kv, Some(&remote));
    assert_eq!(first.load_for_user("seller_1").await, Tier::Seeded);
    assert_eq!(first.conversations().await.len(), 3);
    assert_eq!(first.unread_count().await, 2);
    assert_eq!(*first.subscribe_unread().borrow(), 2);
    assert_eq!(first.notifications().await.len(), 2);

    let second = open_store(&kv, Some(&remote));
    assert_eq!(second.load_for_user("seller_1").await, Tier::LocalCache);
    assert_eq!(second.conversations().await, first.conversations().await);
}

#[tokio::test]
async fn stored_data_of_another_user_is_not_shown() {
    let kv = Arc::new(MemoryKv::new());
    let alice = open_store(&kv, None);
    alice.load_for_user("alice").await;

    let bob = open_store(&kv, None);
    assert_eq!(bob.load_for_user("bob").await, Tier::Seeded);
    for conv in bob.conversations().await {
        assert!(conv.has_participant("bob"));
        assert!(!conv.has_participant("alice"));
    }
}

#[tokio::test]
async fn remote_data_wins_when_available() {
    let kv = Arc::new(MemoryKv::new());
    let remote = FakeRemote::online();
    remote.add_conversation("srv_conv_a", &["alice", "bob"]);
    remote.add_conversation("srv_conv_b", &["carol", "dave"]);

    let store = open_store(&kv, Some(&remote));
    assert_eq!(store.load_for_user("alice").await, Tier::Remote);
    let ids: Vec<String> = store.conversations().await.into_iter().map(|c| c.id).collect();
    assert_eq!(ids, vec!["srv_conv_a".to_string()]);
}

#[tokio::test]
async fn send_offline_keeps_message_locally() {
    let kv = Arc::new(MemoryKv::new());
    let remote = FakeRemote::offline();
    let store = open_store(&kv, Some(&remote));
    store.load_for_user("seller_1").await;

    let before = store.get_conversation_messages("conv_1").await.len();
    let sent = store
        .send_message("conv_1", "Je vous envoie un devis.", Vec::new())
        .await
        .unwrap();

    assert!(is_local_id(&sent.id));
    assert_eq!(sent.sender_id, "seller_1");
    assert_eq!(sent.receiver_id, "client_1");
    assert!(!sent.is_read);

    let history = store.get_conversation_messages("conv_1").await;
    assert_eq!(history.len(), before + 1);
    assert_eq!(history.last(), Some(&sent));

    let conv = store.get_conversation("conv_1").await.unwrap();
    assert_eq!(conv.last_message.as_deref(), Some(&sent));
    assert_eq!(conv.last_activity, Some(sent.timestamp));

    // Survives a restart through local storage
    let reopened = open_store(&kv, None);
    assert_eq!(reopened.load_for_user("seller_1").await, Tier::LocalCache);
    let history = reopened.get_conversation_messages("conv_1").await;
    assert_eq!(history.last().map(|m| m.id.as_str()), Some(sent.id.as_str()));
}

#[tokio::test]
async fn offline_files_become_local_references() {
    let kv = Arc::new(MemoryKv::new());
    let store = open_store(&kv, None);
    store.load_for_user("seller_1").await;

    let sent = store
        .send_message(
            "conv_2",
            "",
            vec![
                OutgoingAttachment::File {
                    name: "logo.png".into(),
                    content_type: "image/png".into(),
                    data: Bytes::from_static(b"\x89PNG"),
                },
                OutgoingAttachment::Link {
                    url: "https://example.com/brief".into(),
                    name: None,
                },
            ],
        )
        .await
        .unwrap();

    assert_eq!(sent.content, "");
    assert_eq!(sent.attachments.len(), 2);
    assert_eq!(sent.attachments[0].kind, AttachmentKind::Image);
    assert!(sent.attachments[0].url.starts_with("local://"));
    assert_eq!(sent.attachments[0].size, Some(4));
    assert_eq!(sent.attachments[1].kind, AttachmentKind::Link);
    assert_eq!(sent.attachments[1].url, "https://example.com/brief");
}

#[tokio::test]
async fn send_validates_input() {
    let kv = Arc::new(MemoryKv::new());
    let store = open_store(&kv, None);
    store.load_for_user("seller_1").await;

    assert!(matches!(
        store.send_message("conv_1", "   ", Vec::new()).await,
        Err(StoreError::Validation(_))
    ));
    assert!(matches!(
        store.send_message("", "hello", Vec::new()).await,
        Err(StoreError::Validation(_))
    ));
    assert!(matches!(
        store.send_message("conv_missing", "hello", Vec::new()).await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn send_online_uses_server_message() {
    let kv = Arc::new(MemoryKv::new());
    let remote = FakeRemote::online();
    remote.add_conversation("srv_conv_a", &["alice", "bob"]);

    let store = open_store(&kv, Some(&remote));
    store.load_for_user("alice").await;

    let sent = store
        .send_message("srv_conv_a", "Hello Bob", Vec::new())
        .await
        .unwrap();
    assert!(!is_local_id(&sent.id));
    assert_eq!(sent.receiver_id, "bob");
    assert_eq!(remote.messages.lock().unwrap()["srv_conv_a"].len(), 1);
}

#[tokio::test]
async fn create_conversation_is_idempotent() {
    let kv = Arc::new(MemoryKv::new());
    let remote = FakeRemote::offline();
    let store = open_store(&kv, Some(&remote));
    store.load_for_user("seller_1").await;

    // Seeded pair is found, not duplicated
    assert_eq!(store.create_conversation("client_1", None).await.unwrap(), "conv_1");

    let first = store.create_conversation("bob", Some("Logo")).await.unwrap();
    let second = store.create_conversation("bob", None).await.unwrap();
    assert_eq!(first, second);
    assert!(is_local_id(&first));
    assert!(store.get_conversation_messages(&first).await.is_empty());

    let conv = store.get_conversation(&first).await.unwrap();
    assert_eq!(conv.title.as_deref(), Some("Logo"));
    assert!(conv.is_between("seller_1", "bob"));

    assert!(matches!(
        store.create_conversation("seller_1", None).await,
        Err(StoreError::Validation(_))
    ));
    assert!(matches!(
        store.create_conversation("  ", None).await,
        Err(StoreError::Validation(_))
    ));
}

#[tokio::test]
async fn mark_as_read_clears_unread_and_notifications() {
    let kv = Arc::new(MemoryKv::new());
    let remote = FakeRemote::offline();
    let store = open_store(&kv, Some(&remote));
    store.load_for_user("seller_1").await;

    let mut unread = store.subscribe_unread();
    assert_eq!(*unread.borrow_and_update(), 2);

    assert_eq!(store.mark_as_read("conv_1").await.unwrap(), 1);
    assert_eq!(store.unread_count().await, 1);
    assert!(unread.has_changed().unwrap());
    assert_eq!(*unread.borrow_and_update(), 1);

    assert!(
        store
            .get_conversation_messages("conv_1")
            .await
            .iter()
            .all(|m| m.receiver_id != "seller_1" || m.is_read)
    );
    let notif = store
        .notifications()
        .await
        .into_iter()
        .find(|n| n.conversation_id == "conv_1")
        .unwrap();
    assert!(notif.is_read);

    // Repeat is a no-op
    assert_eq!(store.mark_as_read("conv_1").await.unwrap(), 0);
    assert_eq!(store.unread_count().await, 1);
    assert_eq!(store.mark_as_read("conv_missing").await.unwrap(), 0);
}

#[tokio::test]
async fn mark_as_read_tells_the_server() {
    let kv = Arc::new(MemoryKv::new());
    let remote = FakeRemote::online();
    remote.add_conversation("srv_conv_a", &["alice", "bob"]);
    let store = open_store(&kv, Some(&remote));
    store.load_for_user("alice").await;

    store.mark_as_read("srv_conv_a").await.unwrap();

    // The call is fire-and-forget
    for _ in 0..50 {
        if !remote.mark_read_calls.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        remote.mark_read_calls.lock().unwrap().as_slice(),
        &[("srv_conv_a".to_string(), "alice".to_string())]
    );
}

#[tokio::test]
async fn delete_conversation_removes_everything_for_it() {
    let kv = Arc::new(MemoryKv::new());
    let store = open_store(&kv, None);
    store.load_for_user("seller_1").await;

    assert!(store.delete_conversation("conv_3").await.unwrap());
    assert!(store.get_conversation("conv_3").await.is_none());
    assert!(store.get_conversation_messages("conv_3").await.is_empty());
    assert!(
        store
            .notifications()
            .await
            .iter()
            .all(|n| n.conversation_id != "conv_3")
    );
    assert_eq!(store.unread_count().await, 1);

    assert!(!store.delete_conversation("conv_3").await.unwrap());
}

#[tokio::test]
async fn notification_can_be_marked_read() {
    let kv = Arc::new(MemoryKv::new());
    let store = open_store(&kv, None);
    store.load_for_user("seller_1").await;

    assert!(store.mark_notification_read("notif_2").await.unwrap());
    let notif = store
        .notifications()
        .await
        .into_iter()
        .find(|n| n.id == "notif_2")
        .unwrap();
    assert!(notif.is_read);
    // Reading a notification does not read the message behind it
    assert_eq!(store.unread_count().await, 2);
    assert!(!store.mark_notification_read("notif_missing").await.unwrap());
}

#[tokio::test]
async fn delete_message_moves_last_message_back() {
    let kv = Arc::new(MemoryKv::new());
    let store = open_store(&kv, None);
    store.load_for_user("seller_1").await;

    assert!(store.delete_message("conv_1", "msg_3").await.unwrap());
    let conv = store.get_conversation("conv_1").await.unwrap();
    assert_eq!(conv.last_message.map(|m| m.id), Some("msg_2".to_string()));
    assert_eq!(store.unread_count().await, 1);

    assert!(!store.delete_message("conv_1", "msg_3").await.unwrap());
    assert!(!store.delete_message("conv_missing", "msg_1").await.unwrap());
}

#[tokio::test]
async fn typing_indicator_expires() {
    let kv = Arc::new(MemoryKv::new());
    let store = open_store(&kv, None);
    store.load_for_user("seller_1").await;

    store.set_typing("conv_1", true).await.unwrap();
    let indicator = store.get_conversation("conv_1").await.unwrap().is_typing.unwrap();
    assert_eq!(indicator.user_id, "seller_1");

    let soon = indicator.timestamp + chrono::Duration::seconds(1);
    assert_eq!(store.expire_typing_at(soon).await, 0);
    assert!(store.get_conversation("conv_1").await.unwrap().is_typing.is_some());

    let later = indicator.timestamp + chrono::Duration::seconds(6);
    assert_eq!(store.expire_typing_at(later).await, 1);
    assert!(store.get_conversation("conv_1").await.unwrap().is_typing.is_none());

    // Unknown conversation is ignored
    store.set_typing("conv_missing", true).await.unwrap();
}

#[tokio::test]
async fn typing_ticker_clears_stale_indicators() {
    let kv = Arc::new(MemoryKv::new());
    let config = StoreConfig {
        typing_timeout: Duration::from_millis(50),
        typing_tick: Duration::from_millis(20),
        ..StoreConfig::default()
    };
    let store = store_with(config, &kv, None);
    store.load_for_user("seller_1").await;

    store.set_typing("conv_2", true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(store.get_conversation("conv_2").await.unwrap().is_typing.is_none());
}

#[tokio::test]
async fn typing_is_never_persisted() {
    let kv = Arc::new(MemoryKv::new());
    let store = open_store(&kv, None);
    store.load_for_user("seller_1").await;

    store.set_typing("conv_1", true).await.unwrap();
    store.mark_as_read("conv_2").await.unwrap();

    let raw = kv.get(workit_store::persistence::CONVERSATIONS_KEY).unwrap().unwrap();
    assert!(!raw.contains("isTyping"));
}

#[tokio::test]
async fn events_follow_mutations() {
    let kv = Arc::new(MemoryKv::new());
    let store = open_store(&kv, None);
    store.load_for_user("seller_1").await;
    let mut events = store.subscribe();

    let sent = store.send_message("conv_2", "Voici une maquette", Vec::new()).await.unwrap();
    store.delete_conversation("conv_2").await.unwrap();

    match events.recv().await.unwrap() {
        StoreEvent::MessageCreate { message } => assert_eq!(message.id, sent.id),
        other => panic!("unexpected event {:?}", other),
    }
    let deleted = events.recv().await.unwrap();
    assert_eq!(deleted.conversation_id(), Some("conv_2"));
    assert!(matches!(deleted, StoreEvent::ConversationDelete { .. }));
}

#[tokio::test(start_paused = true)]
async fn simulated_reply_arrives_with_notification() {
    let kv = Arc::new(MemoryKv::new());
    let store = store_with(always_reply(), &kv, None);
    store.load_for_user("seller_1").await;
    let unread_before = store.unread_count().await;
    let notifications_before = store.notifications().await.len();

    store.send_message("conv_2", "Des nouvelles ?", Vec::new()).await.unwrap();
    assert_eq!(store.pending_replies("conv_2").await, 1);

    tokio::time::sleep(Duration::from_secs(11)).await;

    let history = store.get_conversation_messages("conv_2").await;
    let reply = history.last().unwrap();
    assert_eq!(reply.sender_id, "client_2");
    assert_eq!(reply.receiver_id, "seller_1");
    assert!(!reply.is_read);
    assert_eq!(store.unread_count().await, unread_before + 1);

    let notifications = store.notifications().await;
    assert_eq!(notifications.len(), notifications_before + 1);
    assert_eq!(notifications.last().unwrap().message, REPLY_NOTIFICATION);
}

#[tokio::test(start_paused = true)]
async fn deleting_a_conversation_cancels_its_reply() {
    let kv = Arc::new(MemoryKv::new());
    let store = store_with(always_reply(), &kv, None);
    store.load_for_user("seller_1").await;

    store.send_message("conv_2", "Des nouvelles ?", Vec::new()).await.unwrap();
    assert_eq!(store.pending_replies("conv_2").await, 1);

    store.delete_conversation("conv_2").await.unwrap();
    assert_eq!(store.pending_replies("conv_2").await, 0);

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(store.get_conversation("conv_2").await.is_none());
    assert!(store.get_conversation_messages("conv_2").await.is_empty());
    assert!(
        store
            .notifications()
            .await
            .iter()
            .all(|n| n.conversation_id != "conv_2")
    );
}

#[tokio::test]
async fn end_session_clears_state() {
    let kv = Arc::new(MemoryKv::new());
    let store = open_store(&kv, None);
    store.load_for_user("seller_1").await;
    assert_eq!(store.current_user().await.as_deref(), Some("seller_1"));

    store.end_session().await;
    assert_eq!(store.current_user().await, None);
    assert!(store.conversations().await.is_empty());
    assert_eq!(*store.subscribe_unread().borrow(), 0);
    assert!(matches!(
        store.send_message("conv_1", "hi", Vec::new()).await,
        Err(StoreError::Authentication)
    ));
}

#[tokio::test]
async fn offline_conversation_survives_reconnect() {
    let kv = Arc::new(MemoryKv::new());
    let remote = FakeRemote::offline();

    let offline = open_store(&kv, Some(&remote));
    offline.load_for_user("alice").await;
    let local_conv = offline.create_conversation("bob", None).await.unwrap();
    assert!(is_local_id(&local_conv));

    remote.add_conversation("srv_conv_c", &["alice", "carol"]);
    remote.set_online(true);

    let online = open_store(&kv, Some(&remote));
    assert_eq!(online.load_for_user("alice").await, Tier::Remote);
    let ids: Vec<String> = online.conversations().await.into_iter().map(|c| c.id).collect();
    assert!(ids.contains(&"srv_conv_c".to_string()));
    assert!(ids.contains(&local_conv));
    // Demo data is replaced once the server has real conversations
    assert!(!ids.contains(&"conv_1".to_string()));
}

#[tokio::test]
async fn refresh_reports_remote_failure_and_keeps_state() {
    let kv = Arc::new(MemoryKv::new());
    let remote = FakeRemote::online();
    remote.add_conversation("srv_conv_a", &["alice", "bob"]);

    let store = open_store(&kv, Some(&remote));
    store.load_for_user("alice").await;

    remote.set_online(false);
    assert!(matches!(
        store.refresh().await,
        Err(StoreError::RemoteUnavailable(_))
    ));
    assert_eq!(store.conversations().await.len(), 1);

    remote.set_online(true);
    remote.add_conversation("srv_conv_b", &["alice", "dave"]);
    assert_eq!(store.refresh().await.unwrap(), Tier::Remote);
    assert_eq!(store.conversations().await.len(), 2);
}

async fn recount_unread(store: &MessageStore, user: &str) -> usize {
    let mut count = 0;
    for conv in store.conversations().await {
        count += store
            .get_conversation_messages(&conv.id)
            .await
            .iter()
            .filter(|m| m.receiver_id == user && !m.is_read)
            .count();
    }
    count
}

#[tokio::test]
async fn new_conversation_scenario() {
    let kv = Arc::new(MemoryKv::new());
    let store = open_store(&kv, None);
    store.load_for_user("u1").await;

    let conv_id = store.create_conversation("u2", Some("API work")).await.unwrap();
    store.send_message(&conv_id, "Hello", Vec::new()).await.unwrap();

    let conv = store.get_conversation(&conv_id).await.unwrap();
    assert!(conv.has_participant("u1") && conv.has_participant("u2"));
    assert_eq!(conv.title.as_deref(), Some("API work"));

    let history = store.get_conversation_messages(&conv_id).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "Hello");
    assert!(!history[0].is_read);
    assert_eq!(history[0].receiver_id, "u2");

    // Messages addressed to the other participant are left alone
    store.mark_as_read(&conv_id).await.unwrap();
    assert!(!store.get_conversation_messages(&conv_id).await[0].is_read);
}

#[tokio::test]
async fn unread_count_matches_messages_after_every_mutation() {
    let kv = Arc::new(MemoryKv::new());
    let store = open_store(&kv, None);
    store.load_for_user("seller_1").await;
    assert_eq!(store.unread_count().await, recount_unread(&store, "seller_1").await);

    store.send_message("conv_1", "Ok", Vec::new()).await.unwrap();
    assert_eq!(store.unread_count().await, recount_unread(&store, "seller_1").await);

    store.mark_as_read("conv_3").await.unwrap();
    assert_eq!(store.unread_count().await, 1);
    assert_eq!(store.unread_count().await, recount_unread(&store, "seller_1").await);

    store.delete_message("conv_1", "msg_3").await.unwrap();
    assert_eq!(store.unread_count().await, 0);
    assert_eq!(store.unread_count().await, recount_unread(&store, "seller_1").await);
    assert_eq!(*store.subscribe_unread().borrow(), 0);
}

/// Local storage whose writes can be switched off.
#[derive(Default)]
struct FlakyKv {
    inner: MemoryKv,
    failing: AtomicBool,
}

impl KeyValueStore for FlakyKv {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.inner.remove(key)
    }

    fn set_many(&self, entries: &[(&str, String)]) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.inner.set_many(entries)
    }
}

#[tokio::test]
async fn failed_write_leaves_stored_state_consistent() {
    let kv = Arc::new(FlakyKv::default());
    let store = MessageStore::new(StoreConfig::default(), kv.clone(), None);
    store.load_for_user("u1").await;

    kv.failing.store(true, Ordering::SeqCst);
    let conv_id = store.create_conversation("u2", Some("API work")).await.unwrap();
    // The session itself is unaffected
    assert!(store.get_conversation(&conv_id).await.is_some());
    kv.failing.store(false, Ordering::SeqCst);

    let reopened = MessageStore::new(StoreConfig::default(), kv.clone(), None);
    assert_eq!(reopened.load_for_user("u1").await, Tier::LocalCache);
    let conversations = reopened.conversations().await;
    assert_eq!(conversations.len(), 3);
    assert!(conversations.iter().all(|c| c.id != conv_id));
    for conv in &conversations {
        assert!(!reopened.get_conversation_messages(&conv.id).await.is_empty());
    }
}

#[tokio::test]
async fn nan_reply_probability_does_not_break_sending() {
    let kv = Arc::new(MemoryKv::new());
    let config = StoreConfig {
        replies: Some(ReplySimulation {
            probability: f64::NAN,
            ..ReplySimulation::default()
        }),
        ..StoreConfig::default()
    };
    let store = store_with(config, &kv, None);
    store.load_for_user("seller_1").await;

    let sent = store.send_message("conv_1", "hi", Vec::new()).await.unwrap();
    assert_eq!(
        store.get_conversation_messages("conv_1").await.last(),
        Some(&sent)
    );
    assert_eq!(store.pending_replies("conv_1").await, 0);
}
