use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use workit_db::KeyValueStore;
use workit_types::models::{Conversation, Message, Notification};

pub const CONVERSATIONS_KEY: &str = "workit_conversations";
pub const MESSAGES_KEY: &str = "workit_messages";
pub const NOTIFICATIONS_KEY: &str = "workit_message_notifications";

/// Everything the store mirrors to local storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub conversations: Vec<Conversation>,
    /// Keyed by conversation id, each list oldest first.
    pub messages: HashMap<String, Vec<Message>>,
    pub notifications: Vec<Notification>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

/// Whole-snapshot mirror of the store in a [`KeyValueStore`].
pub struct Persistence {
    kv: Arc<dyn KeyValueStore>,
    /// Revision of the newest snapshot written so far.
    written: Mutex<u64>,
}

impl Persistence {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            written: Mutex::new(0),
        }
    }

    /// Overwrites the stored snapshot in one write; on failure the previous
    /// snapshot stays whole. A snapshot older than one already written is
    /// dropped, so out-of-order saves cannot roll state back.
    pub async fn save(&self, revision: u64, snapshot: &Snapshot) -> Result<()> {
        let mut written = self.written.lock().await;
        if revision <= *written {
            debug!("Skipping stale snapshot r{} (have r{})", revision, *written);
            return Ok(());
        }

        let entries = vec![
            (CONVERSATIONS_KEY, serde_json::to_string(&snapshot.conversations)?),
            (MESSAGES_KEY, serde_json::to_string(&snapshot.messages)?),
            (NOTIFICATIONS_KEY, serde_json::to_string(&snapshot.notifications)?),
        ];

        let kv = self.kv.clone();
        tokio::task::spawn_blocking(move || kv.set_many(&entries)).await??;

        *written = revision;
        Ok(())
    }

    /// Reads the stored snapshot. Missing or unparsable conversation/message
    /// entries mean "nothing stored"; unparsable entries are removed.
    pub async fn load(&self) -> Option<Snapshot> {
        let kv = self.kv.clone();
        let joined = tokio::task::spawn_blocking(move || load_blocking(kv.as_ref())).await;
        match joined {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Local store read task failed: {}", e);
                None
            }
        }
    }
}

fn load_blocking(kv: &dyn KeyValueStore) -> Option<Snapshot> {
    let conversations = read_entry::<Vec<Conversation>>(kv, CONVERSATIONS_KEY);
    let messages = read_entry::<HashMap<String, Vec<Message>>>(kv, MESSAGES_KEY);

    let (conversations, messages) = match (conversations, messages) {
        (Entry::Parsed(c), Entry::Parsed(m)) => (c, m),
        (c, m) => {
            // A half-readable mirror is as good as none
            if matches!(c, Entry::Corrupt) || matches!(m, Entry::Corrupt) {
                discard(kv, CONVERSATIONS_KEY);
                discard(kv, MESSAGES_KEY);
            }
            return None;
        }
    };

    let notifications = match read_entry::<Vec<Notification>>(kv, NOTIFICATIONS_KEY) {
        Entry::Parsed(n) => n,
        Entry::Corrupt => {
            discard(kv, NOTIFICATIONS_KEY);
            Vec::new()
        }
        Entry::Missing => Vec::new(),
    };

    Some(Snapshot {
        conversations,
        messages,
        notifications,
    })
}

enum Entry<T> {
    Parsed(T),
    Missing,
    Corrupt,
}

fn read_entry<T: DeserializeOwned>(kv: &dyn KeyValueStore, key: &str) -> Entry<T> {
    let raw = match kv.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Entry::Missing,
        Err(e) => {
            warn!("Failed to read {} from local store: {}", key, e);
            return Entry::Missing;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(v) => Entry::Parsed(v),
        Err(e) => {
            warn!("Discarding unparsable {}: {}", key, e);
            Entry::Corrupt
        }
    }
}

fn discard(kv: &dyn KeyValueStore, key: &str) {
    if let Err(e) = kv.remove(key) {
        warn!("Failed to remove {} from local store: {}", key, e);
    }
}
