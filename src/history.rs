/// Conversation history: a bounded, recency-ordered list of past chats.
///
/// The whole list is stored as one JSON array (most recent first) under a
/// single storage key. Every mutation is a read-modify-write of that array,
/// serialized by a mutex so concurrent saves can never push the list past
/// its cap. Read failures degrade to an empty history.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::message::{Message, Role};
use crate::storage::KeyValueStorage;

pub const DEFAULT_HISTORY_KEY: &str = "cmdk-chat-history";
pub const DEFAULT_MAX_CONVERSATIONS: usize = 50;
const TITLE_MAX_CHARS: usize = 50;
const UNTITLED: &str = "New chat";

// ── Types ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    /// Unix milliseconds of the last save
    pub updated_at: i64,
    pub messages: Vec<Message>,
}

impl Conversation {
    /// A fresh conversation titled from its first user message.
    pub fn new(messages: Vec<Message>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), messages)
    }

    pub fn with_id(id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: id.into(),
            title: derive_title(&messages),
            updated_at: 0,
            messages,
        }
    }
}

/// Lightweight entry for "Recent Chats" lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub updated_at: i64,
}

pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

// ── Store ─────────────────────────────────────────────────────────────────────

pub struct ConversationHistory {
    storage: Arc<dyn KeyValueStorage>,
    key: String,
    max_conversations: usize,
    lock: Mutex<()>,
    clock: Clock,
}

impl ConversationHistory {
    pub fn new(storage: Arc<dyn KeyValueStorage>, key: impl Into<String>, max_conversations: usize) -> Self {
        Self {
            storage,
            key: key.into(),
            max_conversations: max_conversations.max(1),
            lock: Mutex::new(()),
            clock: Arc::new(|| chrono::Utc::now().timestamp_millis()),
        }
    }

    /// Replace the wall clock (tests, deterministic embedding).
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn max_conversations(&self) -> usize {
        self.max_conversations
    }

    /// Upsert by id and stamp `updated_at`. When the list grows past the cap
    /// the least recently updated entries are evicted. Returns the stored copy.
    pub fn save(&self, mut conversation: Conversation) -> Result<Conversation> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))?;

        let mut list = self.try_read()?;
        list.retain(|c| c.id != conversation.id);

        conversation.updated_at = (self.clock)();
        // Ahead of any entry with an equal timestamp: the later save wins ties.
        let pos = list
            .iter()
            .position(|c| c.updated_at <= conversation.updated_at)
            .unwrap_or(list.len());
        list.insert(pos, conversation.clone());

        if list.len() > self.max_conversations {
            for evicted in list.drain(self.max_conversations..) {
                tracing::debug!(id = %evicted.id, "evicting conversation");
            }
        }

        self.write(&list)?;
        Ok(conversation)
    }

    /// All conversations, most recently updated first.
    pub fn list(&self) -> Vec<Conversation> {
        let mut list = self.read();
        // Stable: stored order already resolves ties.
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        list
    }

    /// A copy of the stored messages, or `None` when `id` is unknown.
    pub fn load(&self, id: &str) -> Option<Vec<Message>> {
        self.read()
            .into_iter()
            .find(|c| c.id == id)
            .map(|c| c.messages)
    }

    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.read().into_iter().find(|c| c.id == id)
    }

    /// Returns whether an entry was removed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))?;
        let mut list = self.try_read()?;
        let before = list.len();
        list.retain(|c| c.id != id);
        if list.len() == before {
            return Ok(false);
        }
        self.write(&list)?;
        Ok(true)
    }

    pub fn clear(&self) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))?;
        self.write(&[])
    }

    pub fn summaries(&self, limit: usize) -> Vec<ConversationSummary> {
        self.list()
            .into_iter()
            .take(limit)
            .map(|c| ConversationSummary {
                id: c.id,
                title: c.title,
                updated_at: c.updated_at,
            })
            .collect()
    }

    pub fn now(&self) -> i64 {
        (self.clock)()
    }

    /// Lenient read for the query side: any failure reads as empty.
    fn read(&self) -> Vec<Conversation> {
        self.try_read().unwrap_or_else(|e| {
            warn!(key = %self.key, "history read failed: {e:#}");
            Vec::new()
        })
    }

    /// Read for read-modify-write. A failing backend is an error so the
    /// caller never overwrites history it could not see; an absent or
    /// corrupt blob still reads as empty.
    fn try_read(&self) -> Result<Vec<Conversation>> {
        let raw = self
            .storage
            .get(&self.key)
            .with_context(|| format!("reading history '{}'", self.key))?;
        let Some(raw) = raw else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(list) => Ok(list),
            Err(e) => {
                warn!(key = %self.key, "history blob is not valid JSON: {e}");
                Ok(Vec::new())
            }
        }
    }

    fn write(&self, list: &[Conversation]) -> Result<()> {
        let json = serde_json::to_string(list).context("serializing history")?;
        self.storage
            .set(&self.key, &json)
            .with_context(|| format!("writing history '{}'", self.key))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// First user message, whitespace collapsed, capped at 50 chars.
pub fn derive_title(messages: &[Message]) -> String {
    let Some(first) = messages.iter().find(|m| m.role == Role::User) else {
        return UNTITLED.to_string();
    };
    let collapsed = first.content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return UNTITLED.to_string();
    }
    if collapsed.chars().count() > TITLE_MAX_CHARS {
        let cut: String = collapsed.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}…", cut.trim_end())
    } else {
        collapsed
    }
}

/// "just now", "5m ago", "3h ago", "2d ago".
pub fn format_relative_time(updated_at_ms: i64, now_ms: i64) -> String {
    let mins = (now_ms - updated_at_ms).max(0) / 60_000;
    if mins < 1 {
        "just now".to_string()
    } else if mins < 60 {
        format!("{mins}m ago")
    } else if mins < 60 * 24 {
        format!("{}h ago", mins / 60)
    } else {
        format!("{}d ago", mins / (60 * 24))
    }
}
