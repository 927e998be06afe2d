use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_CONVERSATION_TITLE: &str = "New conversation";

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("conversation '{0}' not found")]
    NotFound(String),
    #[error("message index {index} out of range ({len} messages)")]
    MessageIndexOutOfRange { index: usize, len: usize },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Path of the image attached to the turn, e.g. `/generated/<name>`.
    #[serde(default, rename = "image", skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    /// Client-side fields (thinking, grounding, files, ...) kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            text: Some(text.into()),
            attachment: None,
            extra: Map::new(),
        }
    }

    pub fn model(text: impl Into<String>, attachment: Option<String>) -> Self {
        Self {
            role: "model".to_string(),
            text: Some(text.into()),
            attachment,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub messages: Option<Vec<Message>>,
}

/// Newest-first conversation list persisted as one JSON array.
///
/// Every operation re-reads the file and rewrites it whole; callers are
/// expected to serialize writers.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    path: PathBuf,
}

impl ConversationStore {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if !path.exists() {
            write_json(&path, &[])?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> Vec<Conversation> {
        match read_json(&self.path) {
            Ok(conversations) => conversations,
            Err(err) => {
                tracing::warn!(
                    "conversation list {} unreadable, treating as empty: {err:#}",
                    self.path.display()
                );
                Vec::new()
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Conversation, ConversationError> {
        self.list()
            .into_iter()
            .find(|conversation| conversation.id == id)
            .ok_or_else(|| ConversationError::NotFound(id.to_string()))
    }

    pub fn create(&self, title: Option<&str>) -> Result<Conversation, ConversationError> {
        let mut conversations = self.list();
        let now = now_utc_iso();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            title: title
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(DEFAULT_CONVERSATION_TITLE)
                .to_string(),
            messages: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        };
        conversations.insert(0, conversation.clone());
        write_json(&self.path, &conversations)?;
        Ok(conversation)
    }

    pub fn update(
        &self,
        id: &str,
        update: ConversationUpdate,
    ) -> Result<Conversation, ConversationError> {
        self.modify(id, |conversation| {
            if let Some(title) = update.title {
                conversation.title = title;
            }
            if let Some(messages) = update.messages {
                conversation.messages = messages;
            }
            Ok(())
        })
    }

    pub fn append_messages(
        &self,
        id: &str,
        messages: Vec<Message>,
    ) -> Result<Conversation, ConversationError> {
        self.modify(id, |conversation| {
            conversation.messages.extend(messages);
            Ok(())
        })
    }

    /// Removing an unknown id is not an error.
    pub fn delete(&self, id: &str) -> Result<(), ConversationError> {
        let mut conversations = self.list();
        conversations.retain(|conversation| conversation.id != id);
        write_json(&self.path, &conversations)?;
        Ok(())
    }

    pub fn delete_message(&self, id: &str, index: usize) -> Result<Vec<Message>, ConversationError> {
        let updated = self.modify(id, |conversation| {
            let len = conversation.messages.len();
            if index >= len {
                return Err(ConversationError::MessageIndexOutOfRange { index, len });
            }
            conversation.messages.remove(index);
            Ok(())
        })?;
        Ok(updated.messages)
    }

    fn modify<F>(&self, id: &str, apply: F) -> Result<Conversation, ConversationError>
    where
        F: FnOnce(&mut Conversation) -> Result<(), ConversationError>,
    {
        let mut conversations = self.list();
        let conversation = conversations
            .iter_mut()
            .find(|conversation| conversation.id == id)
            .ok_or_else(|| ConversationError::NotFound(id.to_string()))?;
        apply(conversation)?;
        conversation.updated_at = now_utc_iso();
        let updated = conversation.clone();
        write_json(&self.path, &conversations)?;
        Ok(updated)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn read_json(path: &Path) -> anyhow::Result<Vec<Conversation>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json(path: &Path, conversations: &[Conversation]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(conversations)?)?;
    Ok(())
}
