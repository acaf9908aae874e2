//! Turn session state for the active conversation
//!
//! Holds the ordered transcript, the queue of memory writes that still need
//! to reach the long-term store, and the cancellation epoch used to abort an
//! in-flight turn.

use std::collections::VecDeque;

use serde::Serialize;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use super::Turn;
use crate::context::tokens;

/// Bounds for the prompt-facing slice of the transcript
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowBudget {
    /// Keep at most this many of the most recent turns
    pub max_turns: Option<usize>,
    /// Keep the most recent turns whose estimated tokens fit
    pub max_tokens: Option<usize>,
}

impl WindowBudget {
    pub fn turns(max_turns: usize) -> Self {
        Self {
            max_turns: Some(max_turns),
            max_tokens: None,
        }
    }

    pub fn tokens(max_tokens: usize) -> Self {
        Self {
            max_turns: None,
            max_tokens: Some(max_tokens),
        }
    }
}

/// A batch of turns whose memory write has not been confirmed
#[derive(Debug, Clone, Serialize)]
pub struct PendingBatch {
    pub turns: Vec<Turn>,
    pub attempts: u32,
}

#[derive(Debug, Default)]
struct SessionInner {
    transcript: Vec<Turn>,
    pending: VecDeque<PendingBatch>,
}

/// The single active conversation
pub struct Session {
    id: Uuid,
    inner: RwLock<SessionInner>,
    max_pending: usize,
    epoch: watch::Sender<u64>,
}

impl Session {
    pub fn new(max_pending: usize) -> Self {
        Self::restore(Vec::new(), max_pending)
    }

    /// Start a session from a previously persisted transcript
    pub fn restore(turns: Vec<Turn>, max_pending: usize) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            id: Uuid::new_v4(),
            inner: RwLock::new(SessionInner {
                transcript: turns,
                pending: VecDeque::new(),
            }),
            max_pending,
            epoch,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Append a turn to the transcript
    ///
    /// Readers either see the transcript before or after the append, never a
    /// partially written turn.
    pub async fn append(&self, turn: Turn) {
        self.inner.write().await.transcript.push(turn);
    }

    /// Append several turns as one atomic step
    pub async fn append_all(&self, turns: impl IntoIterator<Item = Turn>) {
        let mut inner = self.inner.write().await;
        inner.transcript.extend(turns);
    }

    /// The most recent turns within `budget`, oldest first
    pub async fn window(&self, budget: WindowBudget) -> Vec<Turn> {
        let inner = self.inner.read().await;
        let max_turns = budget.max_turns.unwrap_or(usize::MAX);

        let mut used_tokens = 0usize;
        let mut start = inner.transcript.len();
        for (idx, turn) in inner.transcript.iter().enumerate().rev() {
            if inner.transcript.len() - idx > max_turns {
                break;
            }
            let cost = tokens::estimate_turn(turn);
            if let Some(max_tokens) = budget.max_tokens {
                if used_tokens + cost > max_tokens {
                    break;
                }
            }
            used_tokens += cost;
            start = idx;
        }

        inner.transcript[start..].to_vec()
    }

    /// A copy of the whole transcript
    pub async fn transcript(&self) -> Vec<Turn> {
        self.inner.read().await.transcript.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.transcript.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.transcript.is_empty()
    }

    /// Clear the transcript and the pending write queue
    ///
    /// Returns the number of turns removed.
    pub async fn reset(&self) -> usize {
        let mut inner = self.inner.write().await;
        let cleared = inner.transcript.len();
        inner.transcript.clear();
        inner.pending.clear();
        cleared
    }

    /// Queue a batch for a later write attempt
    ///
    /// The queue is bounded; when full the oldest batch is dropped.
    pub async fn enqueue_pending(&self, batch: PendingBatch) {
        if self.max_pending == 0 {
            tracing::warn!(turns = batch.turns.len(), "Pending write queue disabled, dropping batch");
            return;
        }
        let mut inner = self.inner.write().await;
        while inner.pending.len() >= self.max_pending {
            if let Some(dropped) = inner.pending.pop_front() {
                tracing::warn!(
                    turns = dropped.turns.len(),
                    attempts = dropped.attempts,
                    "Pending write queue full, dropping oldest batch"
                );
            }
        }
        inner.pending.push_back(batch);
    }

    /// Drain every queued batch, oldest first
    pub async fn take_pending(&self) -> Vec<PendingBatch> {
        self.inner.write().await.pending.drain(..).collect()
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.read().await.pending.len()
    }

    /// The current cancellation epoch
    pub fn epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Subscribe to cancellation epoch changes
    pub fn subscribe_cancel(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    /// Abort whichever turn is currently in flight
    pub fn cancel_in_flight(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
        tracing::info!(session_id = %self.id, "Cancellation requested for in-flight turn");
    }
}
