//! Rate-limited LLM client
//!
//! [`LlmClient`] sits between the engine and a [`CompletionProvider`]. Each
//! attempt first reserves capacity from the shared [`RateLimiter`], then
//! calls the provider. Transient failures are retried with backoff; permanent
//! ones and timeouts go straight back to the caller.

pub mod budget;
pub mod retry;

use std::sync::Arc;

use thiserror::Error;

use crate::context::tokens;
use crate::conversation::Message;
use crate::providers::{Completion, CompletionProvider, GenerationParams, ProviderError};

pub use budget::{BudgetSnapshot, RateBudget, RateLimiter, Reservation};
pub use retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Rate limit exceeded for {key}: {reason}")]
    RateLimitExceeded { key: String, reason: String },

    #[error("Generation failed after {attempts} attempts: {last}")]
    GenerationFailed { attempts: u32, last: String },

    #[error("Provider error: {0}")]
    Provider(ProviderError),

    #[error("LLM request timed out")]
    Timeout,
}

impl LlmError {
    /// Whether the same turn could succeed if submitted again later
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::Provider(_))
    }
}

pub struct LlmClient {
    provider: Arc<dyn CompletionProvider>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn CompletionProvider>, limiter: Arc<RateLimiter>, retry: RetryPolicy) -> Self {
        Self {
            provider,
            limiter,
            retry,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Generate a completion for `messages`
    ///
    /// Every attempt sends the identical messages and params.
    pub async fn complete(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Completion, LlmError> {
        let budget = self.limiter.budget_for(self.provider.name(), &params.model).await;
        let estimate = tokens::estimate_messages(messages) as u64 + params.max_tokens as u64;
        let max_wait = self.limiter.max_wait();

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let reservation = budget.acquire(estimate, max_wait).await?;

            tracing::debug!(
                provider = self.provider.name(),
                model = %params.model,
                attempt,
                estimated_tokens = estimate,
                "Calling provider"
            );

            match self.provider.complete(messages, params).await {
                Ok(completion) => {
                    if let Some(usage) = completion.usage {
                        budget.settle(reservation, usage.total()).await;
                    }
                    return Ok(completion);
                }
                Err(ProviderError::Timeout) => return Err(LlmError::Timeout),
                Err(err) if err.is_transient() => {
                    if attempt >= self.retry.max_attempts {
                        tracing::error!(
                            provider = self.provider.name(),
                            attempts = attempt,
                            error = %err,
                            "Provider retries exhausted"
                        );
                        return Err(LlmError::GenerationFailed {
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }

                    let delay = self.retry.delay_for(attempt - 1, &err);
                    tracing::warn!(
                        provider = self.provider.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient provider failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::error!(provider = self.provider.name(), error = %err, "Provider rejected request");
                    return Err(LlmError::Provider(err));
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted provider shared by the LLM and engine tests

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::conversation::Message;
    use crate::providers::{Completion, CompletionProvider, GenerationParams, ProviderError, Usage};

    #[derive(Debug, Clone)]
    pub enum Step {
        Reply(String),
        ReplyWithUsage(String, Usage),
        Transient,
        Limited(Option<Duration>),
        Timeout,
        Permanent,
        /// Sleep before answering, to trip stage timeouts
        Slow(Duration, String),
    }

    /// Provider that plays back a script, repeating the last step
    pub struct ScriptedProvider {
        steps: Mutex<VecDeque<Step>>,
        last: Mutex<Option<Step>>,
        calls: AtomicUsize,
        prompts: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedProvider {
        pub fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                last: Mutex::new(None),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn replying(text: &str) -> Self {
            Self::new(vec![Step::Reply(text.to_string())])
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Messages of every call, in call order
        pub fn prompts(&self) -> Vec<Vec<Message>> {
            self.prompts.lock().unwrap().clone()
        }

        fn next_step(&self) -> Step {
            let mut steps = self.steps.lock().unwrap();
            let mut last = self.last.lock().unwrap();
            match steps.pop_front() {
                Some(step) => {
                    *last = Some(step.clone());
                    step
                }
                None => last.clone().unwrap_or(Step::Permanent),
            }
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            messages: &[Message],
            _params: &GenerationParams,
        ) -> Result<Completion, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(messages.to_vec());

            match self.next_step() {
                Step::Reply(text) => Ok(Completion::text(text)),
                Step::ReplyWithUsage(text, usage) => Ok(Completion {
                    text,
                    usage: Some(usage),
                }),
                Step::Transient => Err(ProviderError::Transient("connection reset".into())),
                Step::Limited(retry_after) => Err(ProviderError::RateLimited { retry_after }),
                Step::Timeout => Err(ProviderError::Timeout),
                Step::Permanent => Err(ProviderError::Permanent("HTTP 401: bad key".into())),
                Step::Slow(delay, text) => {
                    tokio::time::sleep(delay).await;
                    Ok(Completion::text(text))
                }
            }
        }
    }
}
