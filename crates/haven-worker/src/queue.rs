use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::Connection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{Result, WorkerError};
use crate::jobs::{Job, JobKind, PersistAssistantMessage};

/// Durable SQLite-backed job queue.
///
/// Producers (the stream coordinator) and the consumer (WorkerEngine) each
/// hold a clone; the underlying connection is shared behind a Mutex and is
/// intentionally separate from the web handlers' store connection.
#[derive(Clone)]
pub struct JobQueue {
    conn: Arc<Mutex<Connection>>,
}

impl JobQueue {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Enqueue a persistence job, due immediately.
    pub fn enqueue_persist(&self, payload: &PersistAssistantMessage) -> Result<String> {
        let json = serde_json::to_value(payload)
            .map_err(|e| WorkerError::BadPayload(e.to_string()))?;
        self.enqueue(JobKind::PersistAssistantMessage, json, 0)
    }

    /// Enqueue a job due `delay_ms` from now.
    pub fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        delay_ms: u64,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let due = now + ChronoDuration::milliseconds(delay_ms as i64);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs
             (id, kind, payload, status, attempts, next_attempt_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?5)",
            rusqlite::params![
                id,
                kind.as_str(),
                payload.to_string(),
                due.to_rfc3339(),
                now.to_rfc3339()
            ],
        )?;
        debug!(job_id = %id, %kind, "job enqueued");
        Ok(id)
    }

    /// Is any pending job of this kind already queued?
    pub fn has_pending(&self, kind: JobKind) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE kind = ?1 AND status = 'pending'",
            [kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Claim every due pending job, marking the rows running.
    pub fn claim_due(&self) -> Result<Vec<Job>> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();

        let due: Vec<(String, String, String, u32)> = {
            let mut stmt = conn.prepare_cached(
                "SELECT id, kind, payload, attempts FROM jobs
                 WHERE status = 'pending' AND next_attempt_at <= ?1
                 ORDER BY created_at",
            )?;
            let rows: Vec<_> = stmt
                .query_map([&now], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                    ))
                })?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        let mut claimed = Vec::with_capacity(due.len());
        for (id, kind_str, payload_str, attempts) in due {
            let kind: JobKind = match kind_str.parse() {
                Ok(k) => k,
                Err(e) => {
                    warn!(job_id = %id, "unparseable job kind: {e}");
                    conn.execute(
                        "UPDATE jobs SET status = 'dead', last_error = ?1, updated_at = ?2
                         WHERE id = ?3",
                        rusqlite::params![e, now, id],
                    )?;
                    continue;
                }
            };
            let payload: serde_json::Value =
                serde_json::from_str(&payload_str).unwrap_or(serde_json::json!({}));

            conn.execute(
                "UPDATE jobs SET status = 'running', updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id],
            )?;
            claimed.push(Job {
                id,
                kind,
                payload,
                attempts,
            });
        }
        Ok(claimed)
    }

    /// Mark a job done.
    pub fn complete(&self, job_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE jobs SET status = 'completed', updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now, job_id],
        )?;
        if rows == 0 {
            return Err(WorkerError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Record a failure: reschedule with the supplied delay, or move to the
    /// dead-letter state when `delay_ms` is None.
    pub fn fail(&self, job_id: &str, error: &str, delay_ms: Option<u64>) -> Result<()> {
        let now = Utc::now();
        let conn = self.conn.lock().unwrap();
        let rows = match delay_ms {
            Some(ms) => {
                let due = now + ChronoDuration::milliseconds(ms as i64);
                conn.execute(
                    "UPDATE jobs
                     SET status = 'pending', attempts = attempts + 1,
                         next_attempt_at = ?1, last_error = ?2, updated_at = ?3
                     WHERE id = ?4",
                    rusqlite::params![due.to_rfc3339(), error, now.to_rfc3339(), job_id],
                )?
            }
            None => conn.execute(
                "UPDATE jobs
                 SET status = 'dead', attempts = attempts + 1,
                     last_error = ?1, updated_at = ?2
                 WHERE id = ?3",
                rusqlite::params![error, now.to_rfc3339(), job_id],
            )?,
        };
        if rows == 0 {
            return Err(WorkerError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Crash recovery: jobs left running by a previous process go back to
    /// pending so they run again (at-least-once delivery).
    pub fn requeue_stuck(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE jobs SET status = 'pending', next_attempt_at = ?1, updated_at = ?1
             WHERE status = 'running'",
            [&now],
        )?;
        if n > 0 {
            info!(count = n, "requeued jobs stuck in running state");
        }
        Ok(n)
    }

    /// Queue depth by status, for the health endpoint.
    pub fn depth(&self, status: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            [status],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> JobQueue {
        JobQueue::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn payload(user_message_id: &str) -> PersistAssistantMessage {
        PersistAssistantMessage {
            conversation_id: "c1".to_string(),
            user_message_id: user_message_id.to_string(),
            content: "Hello there".to_string(),
            reasoning: None,
            raw: None,
            input_tokens: 2,
            output_tokens: 2,
            total_tokens: 4,
            fallback_token_count: 3,
            model: "m-small".to_string(),
            elapsed_ms: 42,
        }
    }

    #[test]
    fn enqueue_claim_complete_lifecycle() {
        let q = queue();
        let id = q.enqueue_persist(&payload("u1")).unwrap();

        let claimed = q.claim_due().unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].kind, JobKind::PersistAssistantMessage);

        // A running job is not claimable again.
        assert!(q.claim_due().unwrap().is_empty());

        q.complete(&id).unwrap();
        assert_eq!(q.depth("completed").unwrap(), 1);
    }

    #[test]
    fn delayed_jobs_are_not_due_yet() {
        let q = queue();
        q.enqueue(
            JobKind::CleanupExpiredSessions,
            serde_json::json!({}),
            60_000,
        )
        .unwrap();
        assert!(q.claim_due().unwrap().is_empty());
        assert!(q.has_pending(JobKind::CleanupExpiredSessions).unwrap());
    }

    #[test]
    fn fail_with_delay_requeues_with_attempts() {
        let q = queue();
        let id = q.enqueue_persist(&payload("u2")).unwrap();
        let job = q.claim_due().unwrap().remove(0);
        assert_eq!(job.attempts, 0);

        q.fail(&id, "transient", Some(0)).unwrap();
        let retried = q.claim_due().unwrap().remove(0);
        assert_eq!(retried.attempts, 1);

        q.fail(&id, "fatal", None).unwrap();
        assert_eq!(q.depth("dead").unwrap(), 1);
        assert!(q.claim_due().unwrap().is_empty());
    }

    #[test]
    fn requeue_stuck_recovers_running_jobs() {
        let q = queue();
        q.enqueue_persist(&payload("u3")).unwrap();
        let _ = q.claim_due().unwrap();
        assert!(q.claim_due().unwrap().is_empty());

        assert_eq!(q.requeue_stuck().unwrap(), 1);
        assert_eq!(q.claim_due().unwrap().len(), 1);
    }
}
