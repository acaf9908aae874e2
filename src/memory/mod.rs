//! Long-term memory
//!
//! The engine only ever talks to [`MemoryGateway`], which puts a stable
//! recall/write contract in front of whichever [`MemoryBackend`] was
//! configured at startup. The gateway owns result ordering and truncation so
//! backends can return candidates in whatever order is convenient for them.
//! An optional [`Reranker`] rescores facts before they are ranked.

mod mem0;
mod rerank;
mod sqlite;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::conversation::Turn;

pub use mem0::Mem0Backend;
pub use rerank::Reranker;
pub use sqlite::SqliteBackend;

/// What kind of knowledge a record holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Fact,
    /// Graph relation surfaced by the store as enrichment
    Relation,
}

/// A record returned from recall
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub content: String,
    /// Relevance to the query, higher is better
    pub score: Option<f32>,
    pub kind: RecordKind,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Turn the record was derived from, when the store knows it
    pub source_turn: Option<Uuid>,
}

impl MemoryRecord {
    pub fn fact(id: impl Into<String>, content: impl Into<String>, score: Option<f32>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            score,
            kind: RecordKind::Fact,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
            source_turn: None,
        }
    }

    pub fn relation(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: RecordKind::Relation,
            ..Self::fact(id, content, None)
        }
    }
}

/// Confirmation that a batch reached the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReceipt {
    pub backend: String,
    pub turns: usize,
    /// Records the store reports creating; may differ from `turns`
    pub records: usize,
}

/// Raw backend failures
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Memory server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unexpected response: {0}")]
    Decode(String),
}

/// Normalized memory failures seen by the engine
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Memory backend '{backend}' unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("Memory write to '{backend}' failed: {reason}")]
    WriteFailed { backend: String, reason: String },
}

/// A long-term store scoped to one user/persona pair
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Up to `limit` candidates relevant to `query`
    async fn recall(&self, query: &str, limit: usize) -> Result<Vec<MemoryRecord>, BackendError>;

    /// Persist every turn in the batch or none of them; returns records created
    async fn write(&self, turns: &[Turn]) -> Result<usize, BackendError>;

    /// Remove every record in scope
    async fn reset(&self) -> Result<(), BackendError>;
}

/// Backend-independent front for long-term memory
#[derive(Clone)]
pub struct MemoryGateway {
    backend: Option<Arc<dyn MemoryBackend>>,
    reranker: Option<Arc<Reranker>>,
}

impl MemoryGateway {
    pub fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        Self {
            backend: Some(backend),
            reranker: None,
        }
    }

    /// A gateway with no store behind it
    pub fn disabled() -> Self {
        Self {
            backend: None,
            reranker: None,
        }
    }

    /// Rescore recalled facts with `reranker` before ranking
    pub fn with_reranker(mut self, reranker: Reranker) -> Self {
        self.reranker = Some(Arc::new(reranker));
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.as_ref().map(|b| b.name()).unwrap_or("disabled")
    }

    /// Records relevant to `query`, best first, at most `top_k`
    pub async fn recall(&self, query: &str, top_k: usize) -> Result<Vec<MemoryRecord>, MemoryError> {
        let Some(backend) = &self.backend else {
            return Ok(Vec::new());
        };
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut records = backend
            .recall(query, top_k)
            .await
            .map_err(|e| MemoryError::Unavailable {
                backend: backend.name().to_string(),
                reason: e.to_string(),
            })?;

        if let Some(reranker) = &self.reranker {
            reranker.rerank(query, &mut records).await;
        }
        rank(&mut records);
        records.truncate(top_k);

        tracing::debug!(backend = backend.name(), recalled = records.len(), "Memory recall");
        Ok(records)
    }

    /// Persist a batch of turns
    pub async fn write(&self, turns: &[Turn]) -> Result<WriteReceipt, MemoryError> {
        let Some(backend) = &self.backend else {
            return Ok(WriteReceipt {
                backend: "disabled".to_string(),
                turns: turns.len(),
                records: 0,
            });
        };

        let records = backend
            .write(turns)
            .await
            .map_err(|e| MemoryError::WriteFailed {
                backend: backend.name().to_string(),
                reason: e.to_string(),
            })?;

        Ok(WriteReceipt {
            backend: backend.name().to_string(),
            turns: turns.len(),
            records,
        })
    }

    /// Purge every record for the current user/persona
    pub async fn reset(&self) -> Result<(), MemoryError> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };
        backend.reset().await.map_err(|e| MemoryError::Unavailable {
            backend: backend.name().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Score descending, stable; unscored records after scored ones
fn rank(records: &mut [MemoryRecord]) {
    records.sort_by(|a, b| match (a.score, b.score) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}
