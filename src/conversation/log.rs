//! Persistent chat log
//!
//! A JSON array of completed exchanges per (user, persona) pair. It is the
//! human-readable record of the conversation and seeds the session
//! transcript when the process starts.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use super::Turn;

/// One completed exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatLogEntry {
    pub timestamp: DateTime<Utc>,
    pub user_input: String,
    pub final_response: String,
    pub user_id: String,
    pub persona_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatLogError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed chat log {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// File-backed conversation log
pub struct ChatLog {
    path: PathBuf,
    backup_dir: PathBuf,
    user_id: String,
    persona_name: String,
    lock: Mutex<()>,
}

impl ChatLog {
    /// Log stored under `{data_dir}/chats/{user}_{persona}_conversation_log.json`
    pub fn new(data_dir: &Path, user_id: &str, persona_name: &str) -> Self {
        let chats = data_dir.join("chats");
        Self {
            path: chats.join(format!("{}_{}_conversation_log.json", user_id, persona_name)),
            backup_dir: chats.join("backup"),
            user_id: user_id.to_string(),
            persona_name: persona_name.to_string(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every entry; a missing file is an empty log
    pub async fn load(&self) -> Result<Vec<ChatLogEntry>, ChatLogError> {
        let _guard = self.lock.lock().await;
        self.read_entries().await
    }

    /// Load the log as an ordered transcript of user and agent turns
    pub async fn load_turns(&self) -> Result<Vec<Turn>, ChatLogError> {
        let entries = self.load().await?;
        Ok(entries_to_turns(&entries))
    }

    /// Append one exchange
    pub async fn append(&self, user_input: &str, final_response: &str) -> Result<(), ChatLogError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_entries().await?;
        entries.push(ChatLogEntry {
            timestamp: Utc::now(),
            user_input: user_input.to_string(),
            final_response: final_response.to_string(),
            user_id: self.user_id.clone(),
            persona_name: self.persona_name.clone(),
        });
        self.write_entries(&entries).await?;
        tracing::debug!(path = %self.path.display(), entries = entries.len(), "Appended to chat log");
        Ok(())
    }

    /// Copy the current log to a timestamped backup file
    ///
    /// Returns `None` when there is no log to back up.
    pub async fn backup(&self) -> Result<Option<PathBuf>, ChatLogError> {
        let _guard = self.lock.lock().await;
        if !fs::try_exists(&self.path).await.map_err(|e| self.io_err(e))? {
            tracing::info!(path = %self.path.display(), "No existing chat log to back up");
            return Ok(None);
        }

        fs::create_dir_all(&self.backup_dir)
            .await
            .map_err(|e| self.io_err(e))?;

        let timestamp = Local::now().format("%Y%m%d_%H%M%S%3f");
        let backup = self.backup_dir.join(format!(
            "{}_{}_conversation_backup_{}.json",
            self.user_id, self.persona_name, timestamp
        ));
        fs::copy(&self.path, &backup).await.map_err(|e| self.io_err(e))?;

        tracing::info!(backup = %backup.display(), "Chat log backed up");
        Ok(Some(backup))
    }

    /// Remove the log file
    pub async fn clear(&self) -> Result<(), ChatLogError> {
        let _guard = self.lock.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    async fn read_entries(&self) -> Result<Vec<ChatLogEntry>, ChatLogError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content).map_err(|source| ChatLogError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    async fn write_entries(&self, entries: &[ChatLogEntry]) -> Result<(), ChatLogError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| self.io_err(e))?;
        }

        let json = serde_json::to_string_pretty(entries).map_err(|source| ChatLogError::Parse {
            path: self.path.clone(),
            source,
        })?;

        // Write-then-rename so a crash never leaves a truncated log
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await.map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).await.map_err(|e| self.io_err(e))
    }

    fn io_err(&self, source: std::io::Error) -> ChatLogError {
        ChatLogError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Expand logged exchanges into user/agent turn pairs
pub fn entries_to_turns(entries: &[ChatLogEntry]) -> Vec<Turn> {
    let mut turns = Vec::with_capacity(entries.len() * 2);
    for entry in entries {
        if !entry.user_input.is_empty() {
            turns.push(Turn::user(&entry.user_input).with_timestamp(entry.timestamp));
        }
        if !entry.final_response.is_empty() {
            turns.push(Turn::agent(&entry.final_response).with_timestamp(entry.timestamp));
        }
    }
    turns
}
