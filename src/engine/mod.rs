//! Conversation engine
//!
//! The engine owns the single active conversation and runs each user input
//! through the turn graph:
//!
//! 1. Recall relevant memories (skipped when memory is disabled)
//! 2. Assemble the prompt from persona, memories and recent history
//! 3. Generate a reply through the rate-limited LLM client
//! 4. Postprocess the reply with the persona's style filters
//! 5. Persist the exchange to memory, the chat log and the transcript
//!
//! Turns are serialized by a FIFO lock. A turn can be cancelled at any
//! suspension point up to PERSIST; once PERSIST starts the turn commits.

pub mod graph;
pub mod postprocess;
pub mod state;

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{PersonaProfile, Settings};
use crate::context;
use crate::conversation::{ChatLog, PendingBatch, Session, Turn, WindowBudget};
use crate::llm::{BudgetSnapshot, LlmClient, LlmError};
use crate::memory::{MemoryError, MemoryGateway, MemoryRecord};
use crate::providers::{GenerationParams, ProviderError};

pub use graph::{Conditions, Graph, GraphError, NodeSpec, Stage};
pub use postprocess::{filters_for, ReplyFilter};
pub use state::{StageOutcome, TurnError, TurnOutcome, TurnState, TurnStatus, TurnTrace};

#[derive(Debug, Clone)]
struct EngineOptions {
    top_k: usize,
    prompt_token_budget: usize,
    history: WindowBudget,
    persist_retry: bool,
    max_write_attempts: u32,
}

/// What a reset cleared
#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    pub cleared_turns: usize,
    pub memories_purged: bool,
    pub backup: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub persona: String,
    pub user: String,
    pub provider: String,
    pub model: String,
    pub memory_backend: String,
    pub session_id: Uuid,
    pub transcript_turns: usize,
    pub completed_turns: u64,
    pub failed_turns: u64,
    pub pending_writes: usize,
    pub rate_budgets: Vec<BudgetSnapshot>,
}

/// Why a guarded suspension point stopped early
enum Interrupt {
    Cancelled,
    TimedOut,
}

pub struct ConversationEngine {
    persona: Arc<PersonaProfile>,
    session: Arc<Session>,
    llm: Arc<LlmClient>,
    memory: MemoryGateway,
    chat_log: Option<Arc<ChatLog>>,
    graph: Graph,
    filters: Vec<Box<dyn ReplyFilter>>,
    params: GenerationParams,
    options: EngineOptions,
    turn_lock: Mutex<()>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl ConversationEngine {
    pub fn new(
        persona: Arc<PersonaProfile>,
        session: Arc<Session>,
        llm: Arc<LlmClient>,
        memory: MemoryGateway,
        settings: &Settings,
    ) -> Result<Self, GraphError> {
        let graph = Graph::standard(&settings.engine)?;

        Ok(Self {
            filters: filters_for(&persona),
            params: GenerationParams::from_settings(&settings.llm),
            options: EngineOptions {
                top_k: settings.memory.top_k,
                prompt_token_budget: settings.context.prompt_token_budget,
                history: WindowBudget {
                    max_turns: Some(settings.context.max_history_turns),
                    max_tokens: Some(settings.context.history_token_budget),
                },
                persist_retry: settings.memory.persist_retry,
                max_write_attempts: settings.memory.max_write_attempts,
            },
            persona,
            session,
            llm,
            memory,
            chat_log: None,
            graph,
            turn_lock: Mutex::new(()),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Append every completed exchange to `log`
    pub fn with_chat_log(mut self, log: Arc<ChatLog>) -> Self {
        self.chat_log = Some(log);
        self
    }

    pub fn persona(&self) -> &Arc<PersonaProfile> {
        &self.persona
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn memory(&self) -> &MemoryGateway {
        &self.memory
    }

    /// Process one user input
    pub async fn handle_turn(&self, input: &str) -> Result<TurnOutcome, TurnError> {
        let input = input.trim();
        if input.is_empty() {
            tracing::info!("Rejected empty input");
            return Err(TurnError::EmptyInput);
        }

        let _turn = self.turn_lock.lock().await;
        let mut cancel = self.session.subscribe_cancel();
        let epoch = *cancel.borrow_and_update();

        let result = self.run_graph(input, &mut cancel, epoch).await;
        match &result {
            Ok(outcome) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    turn_id = %outcome.turn_id,
                    pipeline_id = %outcome.trace.pipeline_id,
                    status = ?outcome.status,
                    total_ms = outcome.trace.total_ms,
                    "Turn completed"
                );
            }
            Err(TurnError::Cancelled) => {
                tracing::info!("Turn cancelled before commit");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, retryable = e.is_retryable(), "Turn failed");
            }
        }
        result
    }

    async fn run_graph(
        &self,
        input: &str,
        cancel: &mut watch::Receiver<u64>,
        epoch: u64,
    ) -> Result<TurnOutcome, TurnError> {
        let mut state = TurnState::new(input);
        let started_at = Utc::now();
        let memory_enabled = self.memory.is_enabled();

        tracing::info!(
            turn_id = %state.turn_id,
            pipeline_id = %state.trace.pipeline_id,
            input_chars = input.chars().count(),
            "Turn started"
        );

        let mut stage = self.graph.entry();
        let mut steps = 0;

        while !stage.is_terminal() {
            steps += 1;
            if steps > self.graph.max_steps() {
                return Err(TurnError::Internal(format!(
                    "turn exceeded {} graph steps",
                    self.graph.max_steps()
                )));
            }
            // Nothing before PERSIST is visible outside the turn
            if *cancel.borrow() != epoch {
                return Err(TurnError::Cancelled);
            }

            let node = *self
                .graph
                .node(stage)
                .ok_or_else(|| TurnError::Internal(format!("no node for stage {}", stage)))?;

            let begun = Instant::now();
            let (outcome, attempts) = match stage {
                Stage::Begin => (StageOutcome::Succeeded, 1),
                Stage::Recall => (self.recall(&mut state, &node, cancel, epoch).await?, 1),
                Stage::SkipRecall => (StageOutcome::Skipped, 1),
                Stage::Assemble => (self.assemble(&mut state, cancel, epoch).await?, 1),
                Stage::Generate => self.generate(&mut state, &node, cancel, epoch).await?,
                Stage::Postprocess => (self.postprocess(&mut state), 1),
                Stage::Persist => (self.persist(&mut state, &node, started_at).await, 1),
                Stage::Done | Stage::Failed | Stage::FailedPersist => {
                    return Err(TurnError::Internal(format!("terminal stage {} executed", stage)));
                }
            };
            let elapsed = begun.elapsed();

            tracing::info!(
                stage = %stage,
                attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                outcome = ?outcome,
                "Stage finished"
            );

            let conditions = Conditions {
                memory_enabled,
                succeeded: outcome.succeeded(),
            };
            state.trace.record(stage, attempts, elapsed, outcome);

            stage = self
                .graph
                .next(stage, conditions)
                .ok_or_else(|| TurnError::Internal(format!("no transition out of {}", stage)))?;
        }

        match stage {
            Stage::Done | Stage::FailedPersist => Ok(TurnOutcome {
                turn_id: state.turn_id,
                reply: state
                    .reply
                    .take()
                    .ok_or_else(|| TurnError::Internal("turn finished without a reply".to_string()))?,
                status: if stage == Stage::Done {
                    TurnStatus::Done
                } else {
                    TurnStatus::FailedPersist
                },
                trace: state.trace,
            }),
            _ => Err(state
                .error
                .take()
                .unwrap_or_else(|| TurnError::Internal(format!("turn ended in {} without an error", stage)))),
        }
    }

    async fn recall(
        &self,
        state: &mut TurnState,
        node: &NodeSpec,
        cancel: &mut watch::Receiver<u64>,
        epoch: u64,
    ) -> Result<StageOutcome, TurnError> {
        let recall = self.memory.recall(&state.input, self.options.top_k);

        match guarded(cancel, epoch, node.timeout, recall).await {
            Ok(Ok(records)) => {
                tracing::debug!(recalled = records.len(), "Recalled memories");
                state.recalled = records;
                Ok(StageOutcome::Succeeded)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Memory recall failed, continuing without memories");
                Ok(StageOutcome::Degraded(e.to_string()))
            }
            Err(Interrupt::TimedOut) => {
                tracing::warn!(backend = self.memory.backend_name(), "Memory recall timed out, continuing without memories");
                Ok(StageOutcome::Degraded("recall timed out".to_string()))
            }
            Err(Interrupt::Cancelled) => Err(TurnError::Cancelled),
        }
    }

    async fn assemble(
        &self,
        state: &mut TurnState,
        cancel: &mut watch::Receiver<u64>,
        epoch: u64,
    ) -> Result<StageOutcome, TurnError> {
        let history = match guarded(cancel, epoch, None, self.session.window(self.options.history)).await {
            Ok(history) => history,
            Err(Interrupt::Cancelled) => return Err(TurnError::Cancelled),
            Err(Interrupt::TimedOut) => {
                return Err(TurnError::Internal("history read timed out".to_string()));
            }
        };

        let budget = self.options.prompt_token_budget;
        let bundle = context::assemble(&self.persona, &state.recalled, &history, &state.input, budget);

        tracing::debug!(
            messages = bundle.messages.len(),
            estimated_tokens = bundle.estimated_tokens,
            dropped_memories = bundle.dropped_memories,
            dropped_turns = bundle.dropped_turns,
            "Prompt assembled"
        );

        if bundle.over_budget {
            let error = TurnError::PromptTooLarge {
                estimated: bundle.estimated_tokens,
                budget,
            };
            let outcome = StageOutcome::Failed(error.to_string());
            state.error = Some(error);
            return Ok(outcome);
        }

        let outcome = if bundle.dropped_memories > 0 || bundle.dropped_turns > 0 {
            StageOutcome::Degraded(format!(
                "dropped {} memories and {} turns to fit the budget",
                bundle.dropped_memories, bundle.dropped_turns
            ))
        } else {
            StageOutcome::Succeeded
        };
        state.bundle = Some(bundle);
        Ok(outcome)
    }

    async fn generate(
        &self,
        state: &mut TurnState,
        node: &NodeSpec,
        cancel: &mut watch::Receiver<u64>,
        epoch: u64,
    ) -> Result<(StageOutcome, u32), TurnError> {
        let Some(messages) = state.bundle.as_ref().map(|b| b.messages.clone()) else {
            state.error = Some(TurnError::Internal("no prompt assembled".to_string()));
            return Ok((StageOutcome::Failed("no prompt assembled".to_string()), 0));
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let call = self.llm.complete(&messages, &self.params);

            let error = match guarded(cancel, epoch, node.timeout, call).await {
                Err(Interrupt::Cancelled) => return Err(TurnError::Cancelled),
                Ok(Ok(completion)) if completion.text.trim().is_empty() => {
                    LlmError::Provider(ProviderError::Permanent("empty completion".to_string()))
                }
                Ok(Ok(completion)) => {
                    state.raw_reply = Some(completion.text);
                    return Ok((StageOutcome::Succeeded, attempt));
                }
                Ok(Err(LlmError::Timeout)) | Err(Interrupt::TimedOut) => {
                    if attempt < node.max_attempts {
                        tracing::warn!(attempt, max_attempts = node.max_attempts, "Generation timed out, retrying");
                        continue;
                    }
                    LlmError::Timeout
                }
                Ok(Err(e)) => e,
            };

            let outcome = StageOutcome::Failed(error.to_string());
            state.error = Some(TurnError::Generation(error));
            return Ok((outcome, attempt));
        }
    }

    fn postprocess(&self, state: &mut TurnState) -> StageOutcome {
        let raw = state.raw_reply.as_deref().unwrap_or_default();
        let filtered = postprocess::run_filters(&self.filters, raw);
        state.reply = Some(filtered.text);

        if filtered.skipped.is_empty() {
            StageOutcome::Succeeded
        } else {
            StageOutcome::Degraded(format!("skipped filters: {}", filtered.skipped.join(", ")))
        }
    }

    /// Commit the exchange
    ///
    /// Memory first (queued batches before the new one), then the chat log,
    /// then the transcript. Only the memory write can fail the stage.
    async fn persist(&self, state: &mut TurnState, node: &NodeSpec, started_at: DateTime<Utc>) -> StageOutcome {
        let reply = state.reply.clone().unwrap_or_default();
        let user_turn = Turn::user(state.input.as_str())
            .with_timestamp(started_at)
            .with_metadata("turn_id", state.turn_id.to_string());
        let agent_turn = Turn::agent(reply.as_str())
            .with_metadata("turn_id", state.turn_id.to_string())
            .with_metadata("pipeline_id", state.trace.pipeline_id.to_string());

        let mut outcome = StageOutcome::Succeeded;
        if self.memory.is_enabled() {
            let batch = PendingBatch {
                turns: vec![user_turn.clone(), agent_turn.clone()],
                attempts: 0,
            };
            outcome = match self.flush(batch, node.timeout).await {
                Ok(None) => StageOutcome::Succeeded,
                Ok(Some(reason)) => StageOutcome::Degraded(format!("queued write failed: {}", reason)),
                Err(reason) => StageOutcome::Failed(reason),
            };
        }

        if let Some(log) = &self.chat_log {
            if let Err(e) = log.append(&state.input, &reply).await {
                tracing::warn!(error = %e, "Failed to append to chat log");
            }
        }

        self.session.append_all([user_turn, agent_turn]).await;
        outcome
    }

    /// Write queued batches oldest first, then `batch`
    ///
    /// Every batch gets a try while `limit` lasts; the limit covers the whole
    /// flush. Failures go back on the queue in order until they reach
    /// `max_write_attempts`. Returns `Err` when `batch` itself was not written
    /// and `Ok(Some(_))` when only older batches failed.
    async fn flush(&self, batch: PendingBatch, limit: Option<Duration>) -> Result<Option<String>, String> {
        let deadline = limit.map(|limit| Instant::now() + limit);
        let mut batches = self.session.take_pending().await;
        let queued = batches.len();
        batches.push(batch);

        let mut unwritten = Vec::new();
        let mut current_error = None;
        let mut queued_error = None;

        for (idx, mut batch) in batches.into_iter().enumerate() {
            let is_current = idx == queued;

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                if is_current {
                    current_error = Some("memory write timed out".to_string());
                }
                unwritten.push(batch);
                continue;
            }

            let write = self.memory.write(&batch.turns);
            let result = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, write).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err("memory write timed out".to_string()),
                },
                None => write.await.map_err(|e: MemoryError| e.to_string()),
            };

            match result {
                Ok(receipt) => {
                    tracing::debug!(backend = %receipt.backend, turns = receipt.turns, records = receipt.records, "Memory write confirmed");
                }
                Err(reason) => {
                    batch.attempts += 1;
                    if batch.attempts >= self.options.max_write_attempts {
                        tracing::warn!(
                            error = %reason,
                            attempts = batch.attempts,
                            turns = batch.turns.len(),
                            "Memory write keeps failing, dropping batch"
                        );
                    } else {
                        unwritten.push(batch);
                    }
                    if is_current {
                        current_error = Some(reason);
                    } else {
                        queued_error = Some(reason);
                    }
                }
            }
        }

        if !unwritten.is_empty() {
            if self.options.persist_retry {
                tracing::warn!(queued_batches = unwritten.len(), "Memory writes failed, queued for the next turn");
                for batch in unwritten {
                    self.session.enqueue_pending(batch).await;
                }
            } else {
                tracing::warn!(dropped_batches = unwritten.len(), "Memory writes failed, dropping batches");
            }
        } else if queued > 0 {
            tracing::info!(batches = queued, "Flushed queued memory writes");
        }

        match current_error {
            Some(reason) => Err(reason),
            None => Ok(queued_error),
        }
    }

    /// Abort whichever turn is in flight
    pub fn cancel_in_flight(&self) {
        self.session.cancel_in_flight();
    }

    /// Recall outside of a turn
    pub async fn search_memories(&self, query: &str, limit: usize) -> Result<Vec<MemoryRecord>, MemoryError> {
        self.memory.recall(query, limit).await
    }

    /// Start the conversation over
    ///
    /// Cancels the in-flight turn, backs up and clears the chat log, clears
    /// the transcript and, when asked, purges long-term memory.
    pub async fn reset(&self, purge_memories: bool) -> ResetReport {
        self.session.cancel_in_flight();
        let _turn = self.turn_lock.lock().await;

        let mut backup = None;
        if let Some(log) = &self.chat_log {
            match log.backup().await {
                Ok(path) => backup = path,
                Err(e) => tracing::warn!(error = %e, "Chat log backup failed"),
            }
            if let Err(e) = log.clear().await {
                tracing::warn!(error = %e, "Failed to clear chat log");
            }
        }

        let cleared_turns = self.session.reset().await;

        let memories_purged = if purge_memories && self.memory.is_enabled() {
            match self.memory.reset().await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "Memory purge failed");
                    false
                }
            }
        } else {
            false
        };

        tracing::info!(cleared_turns, memories_purged, "Conversation reset");
        ResetReport {
            cleared_turns,
            memories_purged,
            backup,
        }
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            persona: self.persona.character_name.clone(),
            user: self.persona.user_name.clone(),
            provider: self.llm.provider_name().to_string(),
            model: self.params.model.clone(),
            memory_backend: self.memory.backend_name().to_string(),
            session_id: self.session.id(),
            transcript_turns: self.session.len().await,
            completed_turns: self.completed.load(Ordering::Relaxed),
            failed_turns: self.failed.load(Ordering::Relaxed),
            pending_writes: self.session.pending_len().await,
            rate_budgets: self.llm.limiter().snapshots().await,
        }
    }
}

/// Run `fut` unless the turn is cancelled or `limit` elapses first
async fn guarded<F: Future>(
    cancel: &mut watch::Receiver<u64>,
    epoch: u64,
    limit: Option<Duration>,
    fut: F,
) -> Result<F::Output, Interrupt> {
    let work = async {
        match limit {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| Interrupt::TimedOut),
            None => Ok(fut.await),
        }
    };

    tokio::select! {
        biased;
        _ = cancelled(cancel, epoch) => Err(Interrupt::Cancelled),
        out = work => out,
    }
}

async fn cancelled(cancel: &mut watch::Receiver<u64>, epoch: u64) {
    if cancel.wait_for(|current| *current != epoch).await.is_err() {
        // Session dropped; nothing can cancel any more
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::persona_builtin;
    use crate::conversation::{Role, Speaker};
    use crate::llm::testing::{ScriptedProvider, Step};
    use crate::llm::{RateLimiter, RetryPolicy};
    use crate::memory::testing::StubBackend;
    use std::sync::atomic::Ordering as AtomicOrdering;

    struct Harness {
        engine: Arc<ConversationEngine>,
        provider: Arc<ScriptedProvider>,
        backend: Arc<StubBackend>,
    }

    fn harness_with(
        steps: Vec<Step>,
        backend: StubBackend,
        history: Vec<Turn>,
        configure: impl FnOnce(&mut Settings),
    ) -> Harness {
        let mut settings = Settings::default();
        configure(&mut settings);

        let provider = Arc::new(ScriptedProvider::new(steps));
        let backend = Arc::new(backend);
        let llm = LlmClient::new(
            provider.clone(),
            Arc::new(RateLimiter::new(settings.rate_limit.clone())),
            RetryPolicy::from_settings(&settings.retry),
        );
        let session = Arc::new(Session::restore(history, settings.memory.max_pending_batches));
        let engine = ConversationEngine::new(
            Arc::new(persona_builtin::cheerful("Alex")),
            session,
            Arc::new(llm),
            MemoryGateway::new(backend.clone()),
            &settings,
        )
        .unwrap();

        Harness {
            engine: Arc::new(engine),
            provider,
            backend,
        }
    }

    fn harness(steps: Vec<Step>) -> Harness {
        harness_with(steps, StubBackend::default(), Vec::new(), |_| {})
    }

    fn texts(turns: &[Turn]) -> Vec<String> {
        turns.iter().map(|t| t.text.clone()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_recalled_name_reaches_prompt_and_memory() {
        let h = harness_with(
            vec![Step::Reply("Your name is Alex!".into())],
            StubBackend::with_records(vec![MemoryRecord::fact("m1", "User's name is Alex", Some(0.93))]),
            vec![Turn::user("Hi"), Turn::agent("Hello!")],
            |_| {},
        );

        let outcome = h.engine.handle_turn("What's my name?").await.unwrap();

        assert_eq!(outcome.reply, "Your name is Alex!");
        assert_eq!(outcome.status, TurnStatus::Done);
        assert_eq!(
            outcome.trace.path(),
            vec![
                Stage::Begin,
                Stage::Recall,
                Stage::Assemble,
                Stage::Generate,
                Stage::Postprocess,
                Stage::Persist
            ]
        );

        let prompt = &h.provider.prompts()[0];
        assert!(prompt[0].content.contains("You are Sunny, a cheerful assistant chatting with Alex."));
        assert!(prompt[1].content.contains("Relevant context 1: User's name is Alex"));
        assert_eq!(prompt[2], crate::conversation::Message::user("Hi"));
        assert_eq!(prompt[3], crate::conversation::Message::assistant("Hello!"));
        assert_eq!(prompt[4].content, "What's my name?");
        assert_eq!(prompt[5].role, Role::System);

        let written = h.backend.written();
        assert_eq!(written.len(), 1);
        assert_eq!(texts(&written[0]), vec!["What's my name?", "Your name is Alex!"]);
        assert_eq!(written[0][0].speaker, Speaker::User);
        assert_eq!(written[0][1].speaker, Speaker::Agent);

        assert_eq!(
            texts(&h.engine.session().transcript().await),
            vec!["Hi", "Hello!", "What's my name?", "Your name is Alex!"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_memory_still_replies() {
        let backend = StubBackend::default();
        backend.fail_recall.store(true, AtomicOrdering::SeqCst);
        let h = harness_with(vec![Step::Reply("Hi Alex!".into())], backend, Vec::new(), |_| {});

        let outcome = h.engine.handle_turn("Hello").await.unwrap();

        assert_eq!(outcome.reply, "Hi Alex!");
        assert!(matches!(outcome.trace.stages[1].outcome, StageOutcome::Degraded(_)));
        // persona, input, instruction; no memory block
        assert_eq!(h.provider.prompts()[0].len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_recall_degrades_to_empty_context() {
        let backend = StubBackend {
            records: vec![MemoryRecord::fact("m1", "User's name is Alex", Some(0.9))],
            recall_delay: Some(Duration::from_secs(60)),
            ..StubBackend::default()
        };
        let h = harness_with(vec![Step::Reply("Hello!".into())], backend, Vec::new(), |_| {});

        let outcome = h.engine.handle_turn("Hi").await.unwrap();

        assert_eq!(
            outcome.trace.stages[1].outcome,
            StageOutcome::Degraded("recall timed out".into())
        );
        assert_eq!(h.provider.prompts()[0].len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_memory_skips_recall_and_writes() {
        let provider = Arc::new(ScriptedProvider::replying("Hello!"));
        let settings = Settings::default();
        let llm = LlmClient::new(
            provider.clone(),
            Arc::new(RateLimiter::new(settings.rate_limit.clone())),
            RetryPolicy::from_settings(&settings.retry),
        );
        let engine = ConversationEngine::new(
            Arc::new(persona_builtin::cheerful("Alex")),
            Arc::new(Session::new(4)),
            Arc::new(llm),
            MemoryGateway::disabled(),
            &settings,
        )
        .unwrap();

        let outcome = engine.handle_turn("Hi").await.unwrap();

        assert_eq!(outcome.trace.path()[1], Stage::SkipRecall);
        assert_eq!(outcome.trace.stages[1].outcome, StageOutcome::Skipped);
        assert_eq!(outcome.status, TurnStatus::Done);
        assert_eq!(engine.session().len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_persist_queues_batch_and_flushes_next_turn() {
        let h = harness(vec![Step::Reply("First reply".into()), Step::Reply("Second reply".into())]);
        h.backend.set_fail_write(true);

        let first = h.engine.handle_turn("first").await.unwrap();
        assert_eq!(first.status, TurnStatus::FailedPersist);
        assert_eq!(first.reply, "First reply");
        assert_eq!(h.engine.session().pending_len().await, 1);
        assert_eq!(h.engine.session().len().await, 2);

        h.backend.set_fail_write(false);
        let second = h.engine.handle_turn("second").await.unwrap();
        assert_eq!(second.status, TurnStatus::Done);
        assert_eq!(h.engine.session().pending_len().await, 0);

        let written = h.backend.written();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0][0].text, "first");
        assert_eq!(written[1][0].text, "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_persist_without_retry_drops_batch() {
        let h = harness_with(
            vec![Step::Reply("Hello!".into())],
            StubBackend::default(),
            Vec::new(),
            |s| s.memory.persist_retry = false,
        );
        h.backend.set_fail_write(true);

        let outcome = h.engine.handle_turn("Hi").await.unwrap();

        assert_eq!(outcome.status, TurnStatus::FailedPersist);
        assert_eq!(h.engine.session().pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_batch_does_not_block_later_writes() {
        let backend = StubBackend {
            reject_containing: Some("poison".into()),
            ..StubBackend::default()
        };
        let h = harness_with(vec![Step::Reply("ok".into())], backend, Vec::new(), |s| {
            s.memory.max_pending_batches = 2;
        });

        let mut statuses = Vec::new();
        for input in ["poison", "t1", "t2", "t3", "t4"] {
            let outcome = h.engine.handle_turn(input).await.unwrap();
            statuses.push(outcome.status);
            if input == "t1" {
                assert!(matches!(outcome.trace.stages[5].outcome, StageOutcome::Degraded(_)));
            }
        }

        assert_eq!(
            statuses,
            vec![
                TurnStatus::FailedPersist,
                TurnStatus::Done,
                TurnStatus::Done,
                TurnStatus::Done,
                TurnStatus::Done
            ]
        );
        let firsts: Vec<String> = h.backend.written().iter().map(|b| b[0].text.clone()).collect();
        assert_eq!(firsts, vec!["t1", "t2", "t3", "t4"]);
        // Dropped after its third failed attempt
        assert_eq!(h.engine.session().pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_write_queue_drops_oldest_batch() {
        let h = harness_with(vec![Step::Reply("ok".into())], StubBackend::default(), Vec::new(), |s| {
            s.memory.max_pending_batches = 1;
        });
        h.backend.set_fail_write(true);

        for input in ["first", "second", "third"] {
            let outcome = h.engine.handle_turn(input).await.unwrap();
            assert_eq!(outcome.status, TurnStatus::FailedPersist);
        }

        let pending = h.engine.session().take_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].turns[0].text, "third");
        assert_eq!(pending[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_timeout_bounds_the_whole_flush() {
        let backend = StubBackend {
            write_delay: Some(Duration::from_secs(10)),
            ..StubBackend::default()
        };
        let h = harness_with(vec![Step::Reply("ok".into())], backend, Vec::new(), |s| {
            s.engine.persist_timeout_secs = 15;
        });

        h.backend.set_fail_write(true);
        let first = h.engine.handle_turn("first").await.unwrap();
        assert_eq!(first.status, TurnStatus::FailedPersist);

        // The queued batch takes 10s, leaving 5s for a 10s write
        h.backend.set_fail_write(false);
        let second = h.engine.handle_turn("second").await.unwrap();
        assert_eq!(second.status, TurnStatus::FailedPersist);

        let persist = &second.trace.stages[5];
        assert_eq!(persist.stage, Stage::Persist);
        assert!(persist.elapsed_ms < 16_000, "persist took {}ms", persist.elapsed_ms);

        let written = h.backend.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0][0].text, "first");

        let pending = h.engine.session().take_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].turns[0].text, "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_is_persisted_before_next_recall() {
        let h = harness(vec![
            Step::Slow(Duration::from_secs(5), "one".into()),
            Step::Reply("two".into()),
        ]);

        let engine = h.engine.clone();
        let first = tokio::spawn(async move { engine.handle_turn("first").await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let engine = h.engine.clone();
        let second = tokio::spawn(async move { engine.handle_turn("second").await });

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(
            h.backend.events(),
            vec!["recall:first", "write:first", "recall:second", "write:second"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_leaves_transcript_untouched() {
        let h = harness(vec![
            Step::Slow(Duration::from_secs(10), "too late".into()),
            Step::Reply("Hello!".into()),
        ]);

        let engine = h.engine.clone();
        let turn = tokio::spawn(async move { engine.handle_turn("Hi").await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        h.engine.cancel_in_flight();

        let result = turn.await.unwrap();
        assert!(matches!(result, Err(TurnError::Cancelled)));
        assert!(h.engine.session().is_empty().await);
        assert!(h.backend.written().is_empty());

        // The next turn runs normally
        let outcome = h.engine.handle_turn("Hi again").await.unwrap();
        assert_eq!(outcome.reply, "Hello!");
        assert_eq!(texts(&h.engine.session().transcript().await), vec!["Hi again", "Hello!"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generate_timeout_retries_in_place() {
        let h = harness_with(
            vec![
                Step::Slow(Duration::from_secs(30), "too late".into()),
                Step::Reply("Made it!".into()),
            ],
            StubBackend::default(),
            Vec::new(),
            |s| {
                s.engine.generate_timeout_secs = 5;
                s.engine.generate_attempts = 2;
            },
        );

        let outcome = h.engine.handle_turn("Hi").await.unwrap();

        assert_eq!(outcome.reply, "Made it!");
        let generate = &outcome.trace.stages[3];
        assert_eq!(generate.stage, Stage::Generate);
        assert_eq!(generate.attempts, 2);
        assert_eq!(h.provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_timeouts_exhaust_attempts() {
        let h = harness_with(vec![Step::Timeout], StubBackend::default(), Vec::new(), |s| {
            s.engine.generate_attempts = 3;
        });

        let err = h.engine.handle_turn("Hi").await.unwrap_err();

        assert!(matches!(err, TurnError::Generation(LlmError::Timeout)));
        assert!(err.is_retryable());
        assert_eq!(h.provider.calls(), 3);
        assert!(h.engine.session().is_empty().await);
        assert_eq!(h.engine.stats().await.failed_turns, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_provider_error_fails_turn() {
        let h = harness(vec![Step::Permanent]);

        let err = h.engine.handle_turn("Hi").await.unwrap_err();

        assert!(matches!(err, TurnError::Generation(LlmError::Provider(_))));
        assert!(!err.is_retryable());
        assert_eq!(h.provider.calls(), 1);
        assert!(h.backend.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_rate_budget_fails_retryably() {
        let h = harness_with(
            vec![Step::Reply("Hello!".into())],
            StubBackend::default(),
            Vec::new(),
            |s| {
                s.rate_limit.max_calls = 1;
                s.rate_limit.max_wait_secs = 0;
            },
        );

        h.engine.handle_turn("Hi").await.unwrap();
        let err = h.engine.handle_turn("Again").await.unwrap_err();

        assert!(matches!(err, TurnError::Generation(LlmError::RateLimitExceeded { .. })));
        assert!(err.is_retryable());
        assert_eq!(h.provider.calls(), 1);
        assert_eq!(h.engine.session().len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_input_rejected_before_graph() {
        let h = harness(vec![Step::Reply("Hello!".into())]);

        let err = h.engine.handle_turn("   ").await.unwrap_err();

        assert!(matches!(err, TurnError::EmptyInput));
        assert_eq!(
            err.apology(h.engine.persona()),
            "I'm sorry, I didn't receive any input from you, Alex."
        );
        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_prompt_fails_in_assemble() {
        let h = harness_with(vec![Step::Reply("Hello!".into())], StubBackend::default(), Vec::new(), |s| {
            s.context.prompt_token_budget = 10;
        });

        let err = h.engine.handle_turn("Hi").await.unwrap_err();

        assert!(matches!(err, TurnError::PromptTooLarge { budget: 10, .. }));
        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turns_run_in_submission_order() {
        let h = harness(vec![
            Step::Slow(Duration::from_secs(5), "one".into()),
            Step::Reply("two".into()),
        ]);

        let engine = h.engine.clone();
        let first = tokio::spawn(async move { engine.handle_turn("first").await });
        // Let the first turn take the lock
        tokio::time::sleep(Duration::from_millis(10)).await;
        let engine = h.engine.clone();
        let second = tokio::spawn(async move { engine.handle_turn("second").await });

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(
            texts(&h.engine.session().transcript().await),
            vec!["first", "one", "second", "two"]
        );
        // Second turn's prompt saw the first exchange
        let prompts = h.provider.prompts();
        assert!(prompts[1].iter().any(|m| m.content == "one"));
    }

    #[tokio::test]
    async fn test_reset_backs_up_log_and_purges() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(vec![Step::Reply("Hello!".into())]);
        let log = Arc::new(ChatLog::new(dir.path(), "Alex", "cheerful"));

        let engine = ConversationEngine::new(
            h.engine.persona.clone(),
            h.engine.session.clone(),
            h.engine.llm.clone(),
            h.engine.memory.clone(),
            &Settings::default(),
        )
        .unwrap()
        .with_chat_log(log.clone());

        engine.handle_turn("Hi").await.unwrap();
        assert_eq!(log.load().await.unwrap().len(), 1);

        let report = engine.reset(true).await;

        assert_eq!(report.cleared_turns, 2);
        assert!(report.memories_purged);
        assert!(report.backup.as_ref().is_some_and(|p| p.exists()));
        assert!(engine.session().is_empty().await);
        assert!(log.load().await.unwrap().is_empty());
        assert!(h.backend.written().is_empty());
    }

    #[test]
    fn test_cancel_wait_pends_until_epoch_moves() {
        let session = Session::new(1);
        let mut rx = session.subscribe_cancel();

        let mut wait = tokio_test::task::spawn(cancelled(&mut rx, 0));
        tokio_test::assert_pending!(wait.poll());

        session.cancel_in_flight();
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_report_counts() {
        let h = harness(vec![Step::Reply("Hello!".into())]);
        h.engine.handle_turn("Hi").await.unwrap();

        let stats = h.engine.stats().await;
        assert_eq!(stats.persona, "Sunny");
        assert_eq!(stats.provider, "scripted");
        assert_eq!(stats.memory_backend, "stub");
        assert_eq!(stats.transcript_turns, 2);
        assert_eq!(stats.completed_turns, 1);
        assert_eq!(stats.rate_budgets.len(), 1);
    }
}
