//! Per-turn state, trace and errors

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::PersonaProfile;
use crate::context::PromptBundle;
use crate::llm::LlmError;
use crate::memory::MemoryRecord;

use super::graph::Stage;

/// Everything a turn accumulates on its way through the graph
#[derive(Debug)]
pub struct TurnState {
    pub turn_id: Uuid,
    pub input: String,
    pub recalled: Vec<MemoryRecord>,
    pub bundle: Option<PromptBundle>,
    pub raw_reply: Option<String>,
    pub reply: Option<String>,
    /// Why the turn is headed for FAILED
    pub error: Option<TurnError>,
    pub trace: TurnTrace,
}

impl TurnState {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            turn_id: Uuid::new_v4(),
            input: input.into(),
            recalled: Vec::new(),
            bundle: None,
            raw_reply: None,
            reply: None,
            error: None,
            trace: TurnTrace::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    /// Completed on a fallback path
    Degraded(String),
    Failed(String),
    Skipped,
}

impl StageOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, StageOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub outcome: StageOutcome,
}

/// Stages a turn went through, in order
#[derive(Debug, Clone, Serialize)]
pub struct TurnTrace {
    pub pipeline_id: Uuid,
    pub stages: Vec<StageRecord>,
    pub total_ms: u64,
}

impl TurnTrace {
    pub fn new() -> Self {
        Self {
            pipeline_id: Uuid::new_v4(),
            stages: Vec::new(),
            total_ms: 0,
        }
    }

    pub fn record(&mut self, stage: Stage, attempts: u32, elapsed: Duration, outcome: StageOutcome) {
        let elapsed_ms = elapsed.as_millis() as u64;
        self.total_ms += elapsed_ms;
        self.stages.push(StageRecord {
            stage,
            attempts,
            elapsed_ms,
            outcome,
        });
    }

    pub fn path(&self) -> Vec<Stage> {
        self.stages.iter().map(|s| s.stage).collect()
    }
}

impl Default for TurnTrace {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Done,
    /// Reply delivered but not confirmed in long-term memory
    FailedPersist,
}

/// A completed turn
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub turn_id: Uuid,
    pub reply: String,
    pub status: TurnStatus,
    pub trace: TurnTrace,
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Empty input")]
    EmptyInput,

    #[error("Prompt needs ~{estimated} tokens but the budget is {budget}")]
    PromptTooLarge { estimated: usize, budget: usize },

    #[error("Generation failed: {0}")]
    Generation(#[from] LlmError),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TurnError {
    /// Whether submitting the same input again may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TurnError::Generation(e) => e.is_retryable(),
            TurnError::Cancelled => true,
            TurnError::EmptyInput | TurnError::PromptTooLarge { .. } | TurnError::Internal(_) => false,
        }
    }

    /// In-character message shown to the user instead of a reply
    pub fn apology(&self, persona: &PersonaProfile) -> String {
        let user = &persona.user_name;
        match self {
            TurnError::EmptyInput => format!("I'm sorry, I didn't receive any input from you, {}.", user),
            TurnError::PromptTooLarge { .. } => format!(
                "I'm sorry, {}, that message is too long for me to take in at once. Could you shorten it?",
                user
            ),
            TurnError::Cancelled => format!("Okay, {}, I've stopped working on that.", user),
            TurnError::Generation(_) | TurnError::Internal(_) => format!(
                "I'm sorry, {}, I'm having some technical difficulties right now. Please try again in a moment.",
                user
            ),
        }
    }
}
