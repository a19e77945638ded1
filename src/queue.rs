//! The durable-queue adapter contract. Concrete backends (SQLite,
//! MySQL/libdrizzle, PostgreSQL, memcached, Tokyo Cabinet in the source
//! project) are out of scope here — this module defines only the
//! four-function interface they'd implement, plus two trivial in-process
//! implementations useful standalone and in tests.
//!
//! The adapter is called only from the model-owner task, so it is
//! effectively single-threaded from its own point of view even though the
//! trait is `Send + Sync` (required to live behind an `Arc` shared with the
//! rest of the async runtime).

use async_trait::async_trait;
use bytes::Bytes;

use crate::wire::protocol::Priority;

#[derive(Debug, Clone)]
pub struct PersistedJob {
    pub unique: Bytes,
    pub function: Bytes,
    pub data: Bytes,
    pub priority: Priority,
    pub epoch: Option<u64>,
}

#[derive(Debug)]
pub struct QueueError(pub String);

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for QueueError {}

/// Durable store for background jobs, so they survive a restart.
///
/// `done` is not required to be idempotent-proof against a crash between
/// `add` and the in-memory enqueue (a replayed job may re-run); nor is a
/// crash between freeing the in-memory job and calling `done` guaranteed
/// not to replay an already-completed job. Callers must tolerate at-least-
/// once delivery; this is an explicit non-goal to change.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    async fn add(
        &self,
        unique: &[u8],
        function: &[u8],
        data: &[u8],
        priority: Priority,
        when_epoch: Option<u64>,
    ) -> Result<(), QueueError>;

    async fn flush(&self) -> Result<(), QueueError>;

    /// Removes a job's durable record. Must treat "already missing" (e.g.
    /// after a crash) as success.
    async fn done(&self, unique: &[u8], function: &[u8]) -> Result<(), QueueError>;

    /// Invokes `add_callback` once per persisted job found at startup, in
    /// whatever order the backend stores them.
    async fn replay(
        &self,
        add_callback: &mut (dyn FnMut(PersistedJob) + Send),
    ) -> Result<(), QueueError>;

    /// Whether this adapter can honour `SUBMIT_JOB_EPOCH`'s future
    /// eligibility time. Adapters that can't should have `add` reject a
    /// non-`None` `when_epoch` instead of silently dropping it.
    fn supports_epoch(&self) -> bool {
        false
    }
}

/// No persistence at all: the server runs purely in-memory. Background jobs
/// are created and scheduled exactly as foreground ones, just without any
/// subscriber; nothing survives a restart.
#[derive(Debug, Default)]
pub struct NullQueueAdapter;

#[async_trait]
impl QueueAdapter for NullQueueAdapter {
    async fn add(
        &self,
        _unique: &[u8],
        _function: &[u8],
        _data: &[u8],
        _priority: Priority,
        _when_epoch: Option<u64>,
    ) -> Result<(), QueueError> {
        Ok(())
    }

    async fn flush(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn done(&self, _unique: &[u8], _function: &[u8]) -> Result<(), QueueError> {
        Ok(())
    }

    async fn replay(
        &self,
        _add_callback: &mut (dyn FnMut(PersistedJob) + Send),
    ) -> Result<(), QueueError> {
        Ok(())
    }
}

/// An in-process durable store backed by a `Vec`. Not actually durable
/// across a process restart, but exercises the full `add`/`done`/`replay`
/// contract faithfully, so it is useful both for tests and as a "queue
/// without a real database" default.
#[derive(Debug, Default)]
pub struct MemoryQueueAdapter {
    jobs: std::sync::Mutex<Vec<PersistedJob>>,
}

#[async_trait]
impl QueueAdapter for MemoryQueueAdapter {
    async fn add(
        &self,
        unique: &[u8],
        function: &[u8],
        data: &[u8],
        priority: Priority,
        when_epoch: Option<u64>,
    ) -> Result<(), QueueError> {
        self.jobs.lock().unwrap().push(PersistedJob {
            unique: Bytes::copy_from_slice(unique),
            function: Bytes::copy_from_slice(function),
            data: Bytes::copy_from_slice(data),
            priority,
            epoch: when_epoch,
        });
        Ok(())
    }

    async fn flush(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn done(&self, unique: &[u8], function: &[u8]) -> Result<(), QueueError> {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.retain(|j| !(j.unique == unique && j.function == function));
        Ok(())
    }

    async fn replay(
        &self,
        add_callback: &mut (dyn FnMut(PersistedJob) + Send),
    ) -> Result<(), QueueError> {
        let jobs = self.jobs.lock().unwrap().clone();
        for job in jobs {
            add_callback(job);
        }
        Ok(())
    }

    fn supports_epoch(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_adapter_add_replay_done() {
        let q = MemoryQueueAdapter::default();
        q.add(b"u1", b"f", b"data", Priority::Normal, None).await.unwrap();

        let mut seen = Vec::new();
        q.replay(&mut |j| seen.push(j.unique.clone())).await.unwrap();
        assert_eq!(seen, vec![Bytes::from_static(b"u1")]);

        q.done(b"u1", b"f").await.unwrap();
        let mut seen = Vec::new();
        q.replay(&mut |j| seen.push(j.unique.clone())).await.unwrap();
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn test_done_on_missing_entry_is_success() {
        let q = MemoryQueueAdapter::default();
        assert!(q.done(b"missing", b"f").await.is_ok());
    }
}
