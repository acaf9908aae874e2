//! Cross-encoder reranking of recalled facts
//!
//! Talks to a scoring server:
//! - `GET /health`
//! - `POST /score_single` `{query, documents, task}` -> `{scores}`
//!
//! Reranking is best effort. When the server is down, errors, or returns a
//! score count that does not match the documents, records keep the scores
//! the store gave them.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{BackendError, MemoryRecord, RecordKind};

const DEFAULT_TASK: &str = "Given a message from the user, retrieve the memories that help answer it";

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    query: &'a str,
    documents: Vec<&'a str>,
    task: &'a str,
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    #[serde(default)]
    scores: Vec<f32>,
}

pub struct Reranker {
    client: Client,
    base_url: String,
    task: String,
}

impl Reranker {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url: String = base_url.into();

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            task: DEFAULT_TASK.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Replace fact scores with relevance scores from the server
    ///
    /// Relations are left alone. Returns whether scores were applied.
    pub async fn rerank(&self, query: &str, records: &mut [MemoryRecord]) -> bool {
        let documents: Vec<&str> = records
            .iter()
            .filter(|r| r.kind == RecordKind::Fact)
            .map(|r| r.content.as_str())
            .collect();
        if documents.is_empty() {
            return false;
        }
        let count = documents.len();

        let scores = match self.score(query, documents).await {
            Ok(scores) => scores,
            Err(e) => {
                tracing::warn!(url = %self.base_url, error = %e, "Reranking unavailable, keeping store order");
                return false;
            }
        };
        if scores.len() != count {
            tracing::warn!(scores = scores.len(), documents = count, "Reranker score count mismatch, keeping store order");
            return false;
        }

        let facts = records.iter_mut().filter(|r| r.kind == RecordKind::Fact);
        for (record, score) in facts.zip(scores) {
            record.score = Some(score);
        }
        tracing::info!(documents = count, "Reranked recalled memories");
        true
    }

    async fn score(&self, query: &str, documents: Vec<&str>) -> Result<Vec<f32>, BackendError> {
        let health = self.client.get(format!("{}/health", self.base_url)).send().await?;
        if !health.status().is_success() {
            return Err(BackendError::Status {
                status: health.status().as_u16(),
                body: "health check failed".to_string(),
            });
        }

        let request = ScoreRequest {
            query,
            documents,
            task: &self.task,
        };
        let response = self
            .client
            .post(format!("{}/score_single", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let parsed: ScoreResponse =
            serde_json::from_str(&body).map_err(|e| BackendError::Decode(format!("score response: {}", e)))?;
        Ok(parsed.scores)
    }
}
