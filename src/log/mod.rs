// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Capability interface over an append-only log with consumer groups.
//!
//! Workers only ever talk to a [`LogClient`]. Two implementations exist:
//! [`RedisLog`] drives a Redis (or Redis Cluster) stream through the redis
//! driver, [`MemoryLog`] keeps the same semantics in process and backs the
//! tests and the `--backend memory` dry run.

mod entry_id;
mod faulty_log;
mod memory_log;
mod redis_log;

pub use entry_id::EntryId;
pub use faulty_log::{FaultyLog, LogOperation};
pub use memory_log::MemoryLog;
pub use redis_log::RedisLog;

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;

pub type LogResult<T> = Result<T, LogError>;

/// Errors surfaced by a log client.
///
/// Everything except [`LogError::GroupExists`] is treated as transient by
/// the workers and retried within their budget.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("consumer group {group} already exists on stream {stream}")]
    GroupExists { stream: String, group: String },

    #[error("no consumer group {group} on stream {stream}")]
    NoGroup { stream: String, group: String },

    #[error("invalid entry id: {0}")]
    InvalidEntryId(String),

    #[error("stream {0} has exhausted the last possible entry id")]
    IdsExhausted(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// One immutable record of the log.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: EntryId,
    pub fields: Vec<(String, Bytes)>,
}

impl Entry {
    pub fn new(id: EntryId, fields: Vec<(String, Bytes)>) -> Self {
        Self { id, fields }
    }

    pub fn field(&self, name: &str) -> Option<&Bytes> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Field value as UTF-8, `None` when missing or not valid UTF-8.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name)
            .and_then(|value| std::str::from_utf8(value).ok())
    }
}

/// One record of a group's pending-entries list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

/// Result of a stale-entry claim.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimBatch {
    /// entries now owned by the claiming consumer
    pub entries: Vec<Entry>,
    /// where the next claim should start, [`EntryId::MIN`] once the scan wrapped
    pub next_cursor: EntryId,
    /// pending ids whose entries no longer exist in the log, dropped from the PEL
    pub deleted: Vec<EntryId>,
    /// claimed records whose entries are gone but whose ids the log did not
    /// report (Redis 6.2 replies with a bare nil)
    pub missing: usize,
}

/// Where a newly created group starts delivering from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// only entries appended after the group was created (`$`)
    Latest,
    /// every entry in the log (`0`)
    Beginning,
    At(EntryId),
}

impl StartPosition {
    pub fn as_arg(&self) -> String {
        match self {
            StartPosition::Latest => "$".to_string(),
            StartPosition::Beginning => "0".to_string(),
            StartPosition::At(id) => id.to_string(),
        }
    }
}

impl FromStr for StartPosition {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "$" => Ok(StartPosition::Latest),
            "0" | "0-0" => Ok(StartPosition::Beginning),
            other => Ok(StartPosition::At(other.parse()?)),
        }
    }
}

/// Cursor of a group read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// entries never delivered to any consumer of the group (`>`)
    Undelivered,
    /// this consumer's own pending entries with ids greater than the given one
    Pending(EntryId),
}

impl ReadCursor {
    pub fn as_arg(&self) -> String {
        match self {
            ReadCursor::Undelivered => ">".to_string(),
            ReadCursor::Pending(id) => id.to_string(),
        }
    }
}

/// How long a group read may wait for entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    NoWait,
    For(Duration),
    Forever,
}

impl Block {
    /// `0` means forever, matching the `BLOCK` argument convention.
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            Block::Forever
        } else {
            Block::For(Duration::from_millis(ms))
        }
    }
}

/// Operations the reliability workers need from the log.
///
/// Implementations must be safe to share between workers without external
/// locking; the log is the synchronization boundary for entry ownership.
pub trait LogClient: Send + Sync + 'static {
    /// Connectivity check.
    fn ping(&self) -> impl Future<Output = LogResult<()>> + Send;

    /// Append one entry and return the id the log assigned.
    fn append(
        &self,
        stream: &str,
        fields: &[(String, Bytes)],
    ) -> impl Future<Output = LogResult<EntryId>> + Send;

    /// Create `group` on `stream`, creating the stream when missing.
    ///
    /// Returns [`LogError::GroupExists`] when the group is already there.
    fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> impl Future<Output = LogResult<()>> + Send;

    /// Read entries for `consumer` within `group`. Entries read with
    /// [`ReadCursor::Undelivered`] enter the group's PEL owned by `consumer`.
    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        block: Block,
        count: usize,
    ) -> impl Future<Output = LogResult<Vec<Entry>>> + Send;

    /// Remove `id` from the group's PEL. `Ok(false)` when it was not pending.
    fn acknowledge(
        &self,
        stream: &str,
        group: &str,
        id: &EntryId,
    ) -> impl Future<Output = LogResult<bool>> + Send;

    /// Transfer up to `count` PEL entries idle for at least `min_idle`, scanning
    /// from `start`, to `consumer`. Each claimed entry's delivery count grows by one.
    fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: &EntryId,
        count: usize,
    ) -> impl Future<Output = LogResult<ClaimBatch>> + Send;

    /// Inspect up to `count` PEL records with ids at or after `start`.
    fn pending(
        &self,
        stream: &str,
        group: &str,
        start: &EntryId,
        count: usize,
    ) -> impl Future<Output = LogResult<Vec<PendingEntry>>> + Send;
}
