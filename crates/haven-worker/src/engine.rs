use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use haven_core::config::RetryConfig;
use haven_core::types::MessageRole;
use haven_store::types::{NewMessage, ProviderMeta};
use haven_store::ConversationStore;

use crate::error::{Result, WorkerError};
use crate::jobs::{Job, JobKind, PersistAssistantMessage};
use crate::queue::JobQueue;

/// How often the periodic session sweep reschedules itself.
const CLEANUP_INTERVAL_MS: u64 = 60_000;

/// Expired stream sessions are owned by the coordinator's KV cache; the
/// worker drives the sweep through this hook so the cleanup job stays on the
/// durable queue with everything else.
pub trait SessionJanitor: Send + Sync {
    fn sweep_expired(&self) -> usize;
}

/// Background consumer of the durable job queue.
///
/// Runs on its own synchronous database connections — never the web
/// handlers' — because mixing streaming request lifetimes with persistence
/// writes is exactly the failure mode this split exists to avoid.
pub struct WorkerEngine {
    queue: JobQueue,
    store: Arc<ConversationStore>,
    janitor: Option<Arc<dyn SessionJanitor>>,
    retry: RetryConfig,
    poll_interval: Duration,
}

impl WorkerEngine {
    pub fn new(
        queue: JobQueue,
        store: Arc<ConversationStore>,
        janitor: Option<Arc<dyn SessionJanitor>>,
        retry: RetryConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            janitor,
            retry,
            poll_interval,
        }
    }

    /// Main loop. Polls until `shutdown` broadcasts true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("persistence worker started");

        if let Err(e) = self.queue.requeue_stuck() {
            error!("requeue of stuck jobs failed: {e}");
        }
        if self.janitor.is_some() {
            match self.queue.has_pending(JobKind::CleanupExpiredSessions) {
                Ok(false) => {
                    let _ = self.queue.enqueue(
                        JobKind::CleanupExpiredSessions,
                        serde_json::json!({}),
                        CLEANUP_INTERVAL_MS,
                    );
                }
                Ok(true) => {}
                Err(e) => error!("cleanup job seed failed: {e}"),
            }
        }

        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        error!("worker tick error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("persistence worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One poll pass: claim every due job and execute it.
    pub fn tick(&self) -> Result<usize> {
        let jobs = self.queue.claim_due()?;
        let count = jobs.len();
        for job in jobs {
            self.dispatch(job);
        }
        Ok(count)
    }

    fn dispatch(&self, job: Job) {
        let job_id = job.id.clone();
        let attempts = job.attempts;
        match self.execute(&job) {
            Ok(()) => {
                debug!(job_id = %job_id, kind = %job.kind, "job completed");
                if let Err(e) = self.queue.complete(&job_id) {
                    error!(job_id = %job_id, "completing job failed: {e}");
                }
            }
            Err(e) => {
                let next_attempt = attempts + 1;
                let retry = e.is_transient() && next_attempt < self.retry.max_attempts;
                if retry {
                    let delay =
                        self.retry.initial_ms * u64::from(self.retry.factor).pow(attempts);
                    warn!(job_id = %job_id, attempt = next_attempt, delay_ms = delay,
                          "job failed, will retry: {e}");
                    if let Err(q) = self.queue.fail(&job_id, &e.to_string(), Some(delay)) {
                        error!(job_id = %job_id, "rescheduling job failed: {q}");
                    }
                } else {
                    // The conversation shows the user message without a
                    // matching assistant message; acceptable degraded state.
                    error!(job_id = %job_id, "job dead-lettered: {e}");
                    if let Err(q) = self.queue.fail(&job_id, &e.to_string(), None) {
                        error!(job_id = %job_id, "dead-lettering job failed: {q}");
                    }
                }
            }
        }
    }

    fn execute(&self, job: &Job) -> Result<()> {
        match job.kind {
            JobKind::PersistAssistantMessage => {
                let payload: PersistAssistantMessage =
                    serde_json::from_value(job.payload.clone())
                        .map_err(|e| WorkerError::BadPayload(e.to_string()))?;
                self.persist_assistant_message(&payload)
            }
            JobKind::CleanupExpiredSessions => {
                if let Some(ref janitor) = self.janitor {
                    let swept = janitor.sweep_expired();
                    if swept > 0 {
                        debug!(swept, "expired stream sessions removed");
                    }
                    // Self-rescheduling keeps exactly one cleanup job alive.
                    self.queue.enqueue(
                        JobKind::CleanupExpiredSessions,
                        serde_json::json!({}),
                        CLEANUP_INTERVAL_MS,
                    )?;
                }
                Ok(())
            }
        }
    }

    fn persist_assistant_message(&self, payload: &PersistAssistantMessage) -> Result<()> {
        // Idempotency: an assistant message referencing this user message is
        // proof the job already ran.
        if self
            .store
            .assistant_exists_for(&payload.conversation_id, &payload.user_message_id)?
        {
            debug!(
                user_message_id = %payload.user_message_id,
                "assistant message already persisted, skipping"
            );
            return Ok(());
        }

        // Provider-attested counts win; the coordinator's local count is the
        // fallback.
        let token_count = if payload.total_tokens > 0 {
            payload.total_tokens
        } else {
            payload.fallback_token_count
        };

        let message = NewMessage {
            role: MessageRole::Assistant,
            content: payload.content.clone(),
            raw_content: payload.raw.clone(),
            reasoning: payload.reasoning.clone(),
            token_count,
            provider_meta: Some(ProviderMeta {
                model: Some(payload.model.clone()),
                input_tokens: Some(payload.input_tokens),
                output_tokens: Some(payload.output_tokens),
                total_tokens: Some(payload.total_tokens),
                elapsed_ms: Some(payload.elapsed_ms),
                user_message_id: Some(payload.user_message_id.clone()),
            }),
        };

        self.store
            .append_message(None, &payload.conversation_id, &message)?;
        Ok(())
    }
}
