use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex, Notify};

use super::operation::{QueuedOperation, SyncOperation};
use super::record::SyncRecord;
use super::store::{BlobStore, CloudError};
use crate::storage::Database;

/// Read-merge-write attempts per delivery before a conflict counts as a
/// failed attempt.
const MAX_CONFLICT_ATTEMPTS: u32 = 3;

/// Retry and timeout settings for the sync queue.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Failed attempts tolerated before an operation is dropped
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// How long an operation may stay in flight before `reconcile` frees it
    pub stuck_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
            stuck_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `retry_count + 1`: `base * 2^(retry_count - 1)`,
    /// capped at `max_backoff`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 1u32
            .checked_shl(retry_count.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// What a call to [`SyncQueue::process_next`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing queued
    Idle,
    /// Another delivery is in flight
    Busy,
    /// The head operation is backing off until `at` (Unix ms)
    NotDue { at: i64 },
    /// The backend rate-limited us; nothing is sent until `until` (Unix ms)
    Paused { until: i64 },
    Delivered,
    Retrying { retry_count: u32, next_attempt_at: i64 },
    Dropped,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    id: i64,
    started_at: i64,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<QueuedOperation>,
    in_flight: Option<InFlight>,
    paused_until: Option<i64>,
}

/// Persistent FIFO of sync operations, delivered one at a time.
///
/// The in-memory queue mirrors the `sync_queue` table and is guarded by a
/// single mutex. The lock is never held while talking to the blob store; an
/// in-flight marker keeps a second caller from starting the next delivery.
pub struct SyncQueue {
    db: Database,
    state: Mutex<QueueState>,
    policy: RetryPolicy,
    notify: Notify,
}

impl SyncQueue {
    /// Restore the queue from the database.
    pub async fn load(db: Database, policy: RetryPolicy) -> Result<Self> {
        let pending: VecDeque<_> = db.load_sync_operations().await?.into();
        if !pending.is_empty() {
            tracing::info!(pending = pending.len(), "Restored sync queue");
        }
        Ok(Self {
            db,
            state: Mutex::new(QueueState {
                pending,
                ..Default::default()
            }),
            policy,
            notify: Notify::new(),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Persist `op` and append it to the queue. `now_ms` doubles as the
    /// logical time of the change when it is merged remotely.
    pub async fn enqueue(&self, op: SyncOperation, now_ms: i64) -> Result<i64> {
        let mut state = self.state.lock().await;
        let id = self.db.enqueue_sync_operation(&op, now_ms).await?;
        tracing::debug!(id = id, operation = %op, "Queued sync operation");
        state.pending.push_back(QueuedOperation {
            id,
            operation: op,
            retry_count: 0,
            enqueued_at: now_ms,
            next_attempt_at: now_ms,
        });
        drop(state);
        self.notify.notify_one();
        Ok(id)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    /// Copy of the queued operations in delivery order.
    pub async fn pending_snapshot(&self) -> Vec<QueuedOperation> {
        self.state.lock().await.pending.iter().cloned().collect()
    }

    /// When the queue next has work, in Unix ms. `None` while idle or while
    /// a delivery is in flight.
    pub async fn next_due(&self) -> Option<i64> {
        let state = self.state.lock().await;
        if state.in_flight.is_some() {
            return None;
        }
        let head = state.pending.front().map(|op| op.next_attempt_at)?;
        Some(match state.paused_until {
            Some(until) => until.max(head),
            None => head,
        })
    }

    /// Wait until something is enqueued or the queue is otherwise woken.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Deliver the head of the queue if it is due.
    ///
    /// Only the head is ever attempted, so operations reach the backend in
    /// the order they were made. Errors are local database failures; backend
    /// failures are folded into the returned outcome.
    pub async fn process_next<S: BlobStore>(&self, store: &S, now_ms: i64) -> Result<ProcessOutcome> {
        let op = {
            let mut state = self.state.lock().await;
            if state.in_flight.is_some() {
                return Ok(ProcessOutcome::Busy);
            }
            if let Some(until) = state.paused_until {
                if now_ms < until {
                    return Ok(ProcessOutcome::Paused { until });
                }
                state.paused_until = None;
            }
            let Some(head) = state.pending.front() else {
                return Ok(ProcessOutcome::Idle);
            };
            if head.next_attempt_at > now_ms {
                return Ok(ProcessOutcome::NotDue {
                    at: head.next_attempt_at,
                });
            }
            let head = head.clone();
            state.in_flight = Some(InFlight {
                id: head.id,
                started_at: now_ms,
            });
            head
        };

        let result = deliver(store, &op.operation, op.enqueued_at).await;

        let mut state = self.state.lock().await;
        if state.in_flight.is_some_and(|f| f.id == op.id) {
            state.in_flight = None;
        }
        let position = state.pending.iter().position(|p| p.id == op.id);

        match result {
            Ok(()) => {
                tracing::debug!(id = op.id, operation = %op.operation, "Sync operation delivered");
                if let Some(idx) = position {
                    state.pending.remove(idx);
                }
                self.db.remove_sync_operation(op.id).await?;
                Ok(ProcessOutcome::Delivered)
            }
            Err(CloudError::RateLimited { retry_after }) => {
                let until = now_ms.saturating_add(duration_ms(retry_after));
                tracing::warn!(
                    operation = %op.operation,
                    retry_after_secs = retry_after.as_secs(),
                    "Sync backend rate limited, pausing queue"
                );
                state.paused_until = Some(until);
                Ok(ProcessOutcome::Paused { until })
            }
            Err(CloudError::Permanent(reason)) => {
                tracing::error!(
                    operation = %op.operation,
                    reason = %reason,
                    "Sync operation rejected, dropping"
                );
                if let Some(idx) = position {
                    state.pending.remove(idx);
                }
                self.db.remove_sync_operation(op.id).await?;
                Ok(ProcessOutcome::Dropped)
            }
            Err(e) => {
                let retry_count = op.retry_count.saturating_add(1);
                if retry_count > self.policy.max_retries {
                    tracing::error!(
                        operation = %op.operation,
                        retries = op.retry_count,
                        error = %e,
                        "Sync operation exhausted retries, dropping"
                    );
                    if let Some(idx) = position {
                        state.pending.remove(idx);
                    }
                    self.db.remove_sync_operation(op.id).await?;
                    return Ok(ProcessOutcome::Dropped);
                }

                let delay = self.policy.backoff(retry_count);
                let next_attempt_at = now_ms.saturating_add(duration_ms(delay));
                tracing::warn!(
                    operation = %op.operation,
                    retry = retry_count,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "Sync delivery failed, backing off"
                );
                if let Some(entry) = position.and_then(|idx| state.pending.get_mut(idx)) {
                    entry.retry_count = retry_count;
                    entry.next_attempt_at = next_attempt_at;
                }
                self.db
                    .update_sync_retry(op.id, retry_count, next_attempt_at)
                    .await?;
                Ok(ProcessOutcome::Retrying {
                    retry_count,
                    next_attempt_at,
                })
            }
        }
    }

    /// Recover from stuck states: an in-flight marker older than the stuck
    /// timeout is cleared and an expired rate-limit pause is lifted.
    ///
    /// Returns `true` when the queue was unblocked.
    pub async fn reconcile(&self, now_ms: i64) -> bool {
        let mut state = self.state.lock().await;
        let mut unblocked = false;

        if let Some(flight) = state.in_flight {
            let stuck_ms = duration_ms(self.policy.stuck_timeout);
            if now_ms.saturating_sub(flight.started_at) >= stuck_ms {
                tracing::warn!(
                    id = flight.id,
                    started_at = flight.started_at,
                    "Sync delivery stuck, releasing queue"
                );
                state.in_flight = None;
                unblocked = true;
            }
        }

        if state.paused_until.is_some_and(|until| until <= now_ms) {
            state.paused_until = None;
            unblocked = true;
        }

        drop(state);
        if unblocked {
            self.notify.notify_one();
        }
        unblocked
    }
}

/// Merge one operation into its remote record.
///
/// Read, merge, conditional write. A version conflict re-reads and merges
/// again; since the merge is a join, repeating it is harmless. A write that
/// would not change the record is skipped.
async fn deliver<S: BlobStore>(store: &S, op: &SyncOperation, at: i64) -> Result<(), CloudError> {
    let key = op.record_key().as_str();
    let mut last_conflict = String::new();

    for attempt in 1..=MAX_CONFLICT_ATTEMPTS {
        let (current, version) = match store.get(key).await? {
            Some(blob) => {
                let record = SyncRecord::from_bytes(&blob.data).map_err(|e| {
                    CloudError::Permanent(format!("Corrupt remote record '{key}': {e}"))
                })?;
                (record, Some(blob.version))
            }
            None => (SyncRecord::default(), None),
        };

        let mut merged = current.clone();
        op.apply_to(&mut merged, at)
            .map_err(|e| CloudError::Permanent(format!("Unencodable operation: {e}")))?;
        if merged == current && version.is_some() {
            return Ok(());
        }

        let bytes = merged
            .to_bytes()
            .map_err(|e| CloudError::Permanent(format!("Unencodable record: {e}")))?;
        match store.put(key, bytes, version).await {
            Ok(_) => return Ok(()),
            Err(CloudError::Conflict(reason)) => {
                tracing::debug!(record = key, attempt = attempt, "Sync write conflict, re-merging");
                last_conflict = reason;
            }
            Err(e) => return Err(e),
        }
    }

    Err(CloudError::Conflict(last_conflict))
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
