//! mem0 REST backend
//!
//! Talks to a mem0 server:
//! - `POST /search` `{query, user_id, agent_id, limit, rerank}`
//! - `POST /memories` `{messages: [{role, content}], user_id, agent_id}`
//! - `DELETE /memories?user_id=..&agent_id=..`
//!
//! Search responses carry scored `results` and, with the graph store
//! enabled, `relations`, which come back as [`RecordKind::Relation`] records.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::Turn;

use super::{BackendError, MemoryBackend, MemoryRecord, RecordKind};

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    user_id: &'a str,
    agent_id: &'a str,
    limit: usize,
    rerank: bool,
}

#[derive(Debug, Serialize)]
struct AddRequest<'a> {
    messages: Vec<AddMessage<'a>>,
    user_id: &'a str,
    agent_id: &'a str,
}

#[derive(Debug, Serialize)]
struct AddMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Older servers return a bare list of results
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    Full {
        #[serde(default)]
        results: Vec<Mem0Memory>,
        #[serde(default)]
        relations: Vec<Value>,
    },
    Bare(Vec<Mem0Memory>),
}

#[derive(Debug, Deserialize)]
struct Mem0Memory {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, alias = "text", alias = "content")]
    memory: String,
    #[serde(default)]
    score: Option<f32>,
    #[serde(default)]
    metadata: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(default)]
    results: Vec<Value>,
}

pub struct Mem0Backend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    user_id: String,
    agent_id: String,
    rerank: bool,
}

impl Mem0Backend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        user_id: impl Into<String>,
        agent_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url: String = base_url.into();

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            user_id: user_id.into(),
            agent_id: agent_id.into(),
            rerank: false,
        })
    }

    /// Ask the server to rerank search results with its own reranker
    pub fn with_rerank(mut self, rerank: bool) -> Self {
        self.rerank = rerank;
        self
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Token {}", key)),
            None => builder,
        }
    }

    async fn check(response: Response) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl MemoryBackend for Mem0Backend {
    fn name(&self) -> &str {
        "mem0"
    }

    async fn recall(&self, query: &str, limit: usize) -> Result<Vec<MemoryRecord>, BackendError> {
        let request = SearchRequest {
            query,
            user_id: &self.user_id,
            agent_id: &self.agent_id,
            limit,
            rerank: self.rerank,
        };

        let response = self
            .authorized(self.client.post(format!("{}/search", self.base_url)))
            .json(&request)
            .send()
            .await?;
        let body = Self::check(response).await?.text().await?;

        let parsed: SearchResponse =
            serde_json::from_str(&body).map_err(|e| BackendError::Decode(format!("search response: {}", e)))?;

        let (results, relations) = match parsed {
            SearchResponse::Full { results, relations } => (results, relations),
            SearchResponse::Bare(results) => (results, Vec::new()),
        };

        let mut records: Vec<MemoryRecord> = results
            .into_iter()
            .enumerate()
            .filter(|(_, m)| !m.memory.trim().is_empty())
            .map(|(i, m)| MemoryRecord {
                id: m.id.unwrap_or_else(|| format!("result-{}", i)),
                content: m.memory,
                score: m.score,
                kind: RecordKind::Fact,
                tags: Vec::new(),
                metadata: m.metadata.unwrap_or_default(),
                source_turn: None,
            })
            .collect();

        records.extend(
            relations
                .iter()
                .enumerate()
                .filter_map(|(i, rel)| relation_text(rel).map(|text| MemoryRecord::relation(format!("relation-{}", i), text))),
        );

        tracing::debug!(results = records.len(), "mem0 search");
        Ok(records)
    }

    async fn write(&self, turns: &[Turn]) -> Result<usize, BackendError> {
        let request = AddRequest {
            messages: turns
                .iter()
                .map(|t| AddMessage {
                    role: t.speaker.role().as_str(),
                    content: &t.text,
                })
                .collect(),
            user_id: &self.user_id,
            agent_id: &self.agent_id,
        };

        let response = self
            .authorized(self.client.post(format!("{}/memories", self.base_url)))
            .json(&request)
            .send()
            .await?;
        let body = Self::check(response).await?.text().await?;

        // Some deployments answer with an empty body
        let created = serde_json::from_str::<AddResponse>(&body)
            .map(|r| r.results.len())
            .unwrap_or(0);
        Ok(created)
    }

    async fn reset(&self) -> Result<(), BackendError> {
        let response = self
            .authorized(self.client.delete(format!("{}/memories", self.base_url)))
            .query(&[("user_id", &self.user_id), ("agent_id", &self.agent_id)])
            .send()
            .await?;
        Self::check(response).await?;

        tracing::info!(user_id = %self.user_id, agent_id = %self.agent_id, "Purged mem0 memories");
        Ok(())
    }
}

/// Render one graph relation as text
///
/// Accepts `{relation}`, `{content}` or `{source, relationship, destination}`.
fn relation_text(relation: &Value) -> Option<String> {
    if let Some(text) = relation
        .get("relation")
        .or_else(|| relation.get("content"))
        .and_then(Value::as_str)
    {
        return Some(text.to_string());
    }

    let source = relation.get("source")?.as_str()?;
    let relationship = relation.get("relationship")?.as_str()?;
    let destination = relation
        .get("destination")
        .or_else(|| relation.get("target"))?
        .as_str()?;
    Some(format!("{} -- {} -- {}", source, relationship, destination))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend_for(server: &MockServer, api_key: Option<&str>) -> Mem0Backend {
        Mem0Backend::new(
            server.uri(),
            api_key.map(String::from),
            "alex",
            "sunny",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_search_maps_results_and_relations() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(header("authorization", "Token secret"))
            .and(body_partial_json(json!({ "query": "What's my name?", "user_id": "alex", "limit": 5 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    { "id": "m1", "memory": "User's name is Alex", "score": 0.91 },
                    { "id": "m2", "memory": "   ", "score": 0.5 }
                ],
                "relations": [
                    { "source": "alex", "relationship": "likes", "destination": "tea" },
                    { "unrelated": true }
                ]
            })))
            .mount(&server)
            .await;

        let records = backend_for(&server, Some("secret"))
            .recall("What's my name?", 5)
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content, "User's name is Alex");
        assert_eq!(records[0].score, Some(0.91));
        assert_eq!(records[1].kind, RecordKind::Relation);
        assert_eq!(records[1].content, "alex -- likes -- tea");
    }

    #[tokio::test]
    async fn test_search_requests_server_rerank() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_partial_json(json!({ "query": "tea", "rerank": true })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [] })))
            .expect(1)
            .mount(&server)
            .await;

        let records = backend_for(&server, None)
            .with_rerank(true)
            .recall("tea", 5)
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_search_accepts_bare_list() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "text": "Alex likes tea" }
            ])))
            .mount(&server)
            .await;

        let records = backend_for(&server, None).recall("tea", 5).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "result-0");
        assert_eq!(records[0].score, None);
    }

    #[tokio::test]
    async fn test_write_sends_roles() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/memories"))
            .and(body_partial_json(json!({
                "messages": [
                    { "role": "user", "content": "My name is Alex" },
                    { "role": "assistant", "content": "Nice to meet you!" }
                ],
                "agent_id": "sunny"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{ "id": "m1", "memory": "Name is Alex", "event": "ADD" }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let created = backend_for(&server, None)
            .write(&[Turn::user("My name is Alex"), Turn::agent("Nice to meet you!")])
            .await
            .unwrap();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/memories"))
            .respond_with(ResponseTemplate::new(500).set_body_string("vector store down"))
            .mount(&server)
            .await;

        let err = backend_for(&server, None)
            .write(&[Turn::user("Hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Status { status: 500, body } if body.contains("vector store")));
    }

    #[tokio::test]
    async fn test_reset_scopes_by_user() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/memories"))
            .and(query_param("user_id", "alex"))
            .and(query_param("agent_id", "sunny"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "deleted" })))
            .expect(1)
            .mount(&server)
            .await;

        backend_for(&server, None).reset().await.unwrap();
    }

    #[test]
    fn test_relation_text_shapes() {
        assert_eq!(relation_text(&json!({ "relation": "a likes b" })).as_deref(), Some("a likes b"));
        assert_eq!(
            relation_text(&json!({ "source": "a", "relationship": "knows", "target": "b" })).as_deref(),
            Some("a -- knows -- b")
        );
        assert!(relation_text(&json!({ "source": "a" })).is_none());
    }
}
