//! Local memory backend using SQLite
//!
//! Every turn written becomes one record, scoped by user and persona.
//! Recall ranks stored records by keyword overlap with the query; equal
//! scores keep the newest record first.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

use crate::conversation::Turn;

use super::{BackendError, MemoryBackend, MemoryRecord, RecordKind};

/// Newest rows considered per recall
const CANDIDATE_LIMIT: i64 = 1000;

const STOPWORDS: &[&str] = &[
    "a", "am", "an", "and", "are", "at", "be", "did", "do", "does", "for", "has", "have", "how", "i", "in",
    "is", "it", "me", "my", "of", "on", "or", "so", "that", "the", "this", "to", "was", "what", "when",
    "where", "who", "why", "with", "you", "your",
];

pub struct SqliteBackend {
    pool: SqlitePool,
    user_id: String,
    agent_id: String,
}

impl SqliteBackend {
    /// Open (or create) the database at `db_path`
    pub async fn new(
        db_path: &Path,
        user_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Result<Self, BackendError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let backend = Self {
            pool,
            user_id: user_id.into(),
            agent_id: agent_id.into(),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Create an in-memory store for testing
    pub async fn new_in_memory_async(
        user_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let backend = Self {
            pool,
            user_id: user_id.into(),
            agent_id: agent_id.into(),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                speaker TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                source_turn TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_memories_scope
            ON memories(user_id, agent_id, seq)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl MemoryBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn recall(&self, query: &str, limit: usize) -> Result<Vec<MemoryRecord>, BackendError> {
        let wanted = keywords(query);
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<(String, String, String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, speaker, content, metadata, source_turn
            FROM memories
            WHERE user_id = ? AND agent_id = ?
            ORDER BY seq DESC
            LIMIT ?
            "#,
        )
        .bind(&self.user_id)
        .bind(&self.agent_id)
        .bind(CANDIDATE_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<MemoryRecord> = rows
            .into_iter()
            .filter_map(|(id, speaker, content, metadata, source_turn)| {
                let found = keywords(&content);
                let overlap = wanted.iter().filter(|w| found.contains(*w)).count();
                if overlap == 0 {
                    return None;
                }
                Some(MemoryRecord {
                    id,
                    score: Some(overlap as f32 / wanted.len() as f32),
                    kind: RecordKind::Fact,
                    tags: vec![speaker],
                    metadata: serde_json::from_str::<BTreeMap<String, Value>>(&metadata).unwrap_or_default(),
                    source_turn: source_turn.and_then(|s| Uuid::parse_str(&s).ok()),
                    content,
                })
            })
            .collect();

        // Stable, so newer rows stay ahead on equal scores
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// Rows are keyed by turn id, so rewriting a batch that already landed
    /// creates nothing and succeeds.
    async fn write(&self, turns: &[Turn]) -> Result<usize, BackendError> {
        let mut tx = self.pool.begin().await?;
        let mut created = 0;

        for turn in turns {
            let metadata = serde_json::to_string(&turn.metadata)
                .map_err(|e| BackendError::Decode(e.to_string()))?;

            let result = sqlx::query(
                r#"
                INSERT INTO memories (id, user_id, agent_id, speaker, content, metadata, source_turn, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(turn.id.to_string())
            .bind(&self.user_id)
            .bind(&self.agent_id)
            .bind(turn.speaker.as_str())
            .bind(&turn.text)
            .bind(metadata)
            .bind(turn.id.to_string())
            .bind(turn.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            created += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn reset(&self) -> Result<(), BackendError> {
        let result = sqlx::query("DELETE FROM memories WHERE user_id = ? AND agent_id = ?")
            .bind(&self.user_id)
            .bind(&self.agent_id)
            .execute(&self.pool)
            .await?;

        tracing::info!(
            user_id = %self.user_id,
            agent_id = %self.agent_id,
            deleted = result.rows_affected(),
            "Purged local memories"
        );
        Ok(())
    }
}

/// Lowercased content words of `text`
fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1)
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}
