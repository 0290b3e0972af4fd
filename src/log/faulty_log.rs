use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use super::{
    Block, ClaimBatch, Entry, EntryId, LogClient, LogError, LogResult, PendingEntry, ReadCursor,
    StartPosition,
};

/// A log operation that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogOperation {
    Append,
    CreateGroup,
    ReadGroup,
    Acknowledge,
    ClaimStale,
}

impl fmt::Display for LogOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogOperation::Append => "append",
            LogOperation::CreateGroup => "create-group",
            LogOperation::ReadGroup => "read-group",
            LogOperation::Acknowledge => "acknowledge",
            LogOperation::ClaimStale => "claim-stale",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Next(u32),
    Always,
}

/// Wraps a [`LogClient`] and fails chosen operations with
/// [`LogError::Connection`] before they reach the inner log.
///
/// Used to rehearse how the workers behave while the log is flapping.
/// `ping` and `pending` always pass through.
pub struct FaultyLog<L> {
    inner: L,
    faults: DashMap<LogOperation, Fault>,
}

impl<L: LogClient> FaultyLog<L> {
    pub fn new(inner: L) -> Self {
        FaultyLog {
            inner,
            faults: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    /// Fail the next `times` calls of `operation`, replacing any fault
    /// already set for it.
    pub fn fail_next(&self, operation: LogOperation, times: u32) -> &Self {
        self.faults.insert(operation, Fault::Next(times));
        self
    }

    /// Fail every call of `operation` until [`FaultyLog::heal`].
    pub fn fail_always(&self, operation: LogOperation) -> &Self {
        self.faults.insert(operation, Fault::Always);
        self
    }

    pub fn heal(&self, operation: LogOperation) {
        self.faults.remove(&operation);
    }

    fn trip(&self, operation: LogOperation) -> LogResult<()> {
        let Some(mut fault) = self.faults.get_mut(&operation) else {
            return Ok(());
        };
        let current = *fault;
        match current {
            Fault::Next(0) => return Ok(()),
            Fault::Next(left) => *fault = Fault::Next(left - 1),
            Fault::Always => {}
        }
        debug!(%operation, "injecting log failure");
        Err(LogError::Connection(format!("injected {operation} failure")))
    }
}

impl<L: LogClient> LogClient for FaultyLog<L> {
    async fn ping(&self) -> LogResult<()> {
        self.inner.ping().await
    }

    async fn append(&self, stream: &str, fields: &[(String, Bytes)]) -> LogResult<EntryId> {
        self.trip(LogOperation::Append)?;
        self.inner.append(stream, fields).await
    }

    async fn create_group(&self, stream: &str, group: &str, start: StartPosition) -> LogResult<()> {
        self.trip(LogOperation::CreateGroup)?;
        self.inner.create_group(stream, group, start).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        block: Block,
        count: usize,
    ) -> LogResult<Vec<Entry>> {
        self.trip(LogOperation::ReadGroup)?;
        self.inner
            .read_group(stream, group, consumer, cursor, block, count)
            .await
    }

    async fn acknowledge(&self, stream: &str, group: &str, id: &EntryId) -> LogResult<bool> {
        self.trip(LogOperation::Acknowledge)?;
        self.inner.acknowledge(stream, group, id).await
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: &EntryId,
        count: usize,
    ) -> LogResult<ClaimBatch> {
        self.trip(LogOperation::ClaimStale)?;
        self.inner
            .claim_stale(stream, group, consumer, min_idle, start, count)
            .await
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        start: &EntryId,
        count: usize,
    ) -> LogResult<Vec<PendingEntry>> {
        self.inner.pending(stream, group, start, count).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;

    fn fields() -> Vec<(String, Bytes)> {
        vec![("message".to_string(), Bytes::from_static(b"x"))]
    }

    #[tokio::test]
    async fn fails_exactly_the_requested_number_of_calls() {
        let log = FaultyLog::new(MemoryLog::new());
        log.fail_next(LogOperation::Append, 2);

        for _ in 0..2 {
            let err = log.append("s", &fields()).await.unwrap_err();
            assert!(matches!(err, LogError::Connection(_)));
        }
        log.append("s", &fields()).await.unwrap();
        assert_eq!(log.inner().len("s"), 1);
    }

    #[tokio::test]
    async fn always_fails_until_healed() {
        let log = FaultyLog::new(MemoryLog::new());
        log.fail_always(LogOperation::CreateGroup);
        for _ in 0..5 {
            assert!(log
                .create_group("s", "g", StartPosition::Beginning)
                .await
                .is_err());
        }
        log.heal(LogOperation::CreateGroup);
        log.create_group("s", "g", StartPosition::Beginning)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn other_operations_pass_through() {
        let log = FaultyLog::new(MemoryLog::new());
        log.fail_always(LogOperation::Acknowledge);
        log.create_group("s", "g", StartPosition::Beginning)
            .await
            .unwrap();
        log.append("s", &fields()).await.unwrap();
        let read = log
            .read_group("s", "g", "c", ReadCursor::Undelivered, Block::NoWait, 10)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
        assert!(log.acknowledge("s", "g", &read[0].id).await.is_err());
        assert_eq!(log.pending("s", "g", &EntryId::MIN, 10).await.unwrap().len(), 1);
    }
}
