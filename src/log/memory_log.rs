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

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use super::{
    Block, ClaimBatch, Entry, EntryId, LogClient, LogError, LogResult, PendingEntry, ReadCursor,
    StartPosition,
};

/// Upper bound of PEL records one claim inspects per requested entry.
const CLAIM_SCAN_FACTOR: usize = 10;

/// In-process log with consumer-group semantics.
///
/// Each stream sits behind its own mutex, so a claim and an ack on the same
/// stream are serialized and PEL ownership is never shared. Idle time is
/// measured with tokio's clock, which lets tests drive the reclaimer with
/// paused time.
#[derive(Debug, Default)]
pub struct MemoryLog {
    streams: DashMap<String, Arc<StreamHandle>>,
}

#[derive(Debug, Default)]
struct StreamHandle {
    state: Mutex<StreamState>,
    appended: Notify,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<EntryId, Vec<(String, Bytes)>>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingRecord>,
}

#[derive(Debug)]
struct PendingRecord {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

fn no_group(stream: &str, group: &str) -> LogError {
    LogError::NoGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently stored in `stream`.
    pub fn len(&self, stream: &str) -> usize {
        self.handle(stream)
            .map(|handle| handle.state.lock().entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// Remove an entry from the log. PEL records pointing at it are left in
    /// place and dropped by the next claim that reaches them.
    pub fn delete(&self, stream: &str, id: &EntryId) -> bool {
        self.handle(stream)
            .map(|handle| handle.state.lock().entries.remove(id).is_some())
            .unwrap_or(false)
    }

    fn handle(&self, stream: &str) -> Option<Arc<StreamHandle>> {
        self.streams.get(stream).map(|handle| Arc::clone(&handle))
    }

    fn handle_or_create(&self, stream: &str) -> Arc<StreamHandle> {
        Arc::clone(&self.streams.entry(stream.to_string()).or_default())
    }
}

impl StreamState {
    fn next_id(&self, stream: &str) -> LogResult<EntryId> {
        let now = wall_clock_ms();
        if now > self.last_id.ms {
            Ok(EntryId::new(now, 0))
        } else {
            self.last_id
                .next()
                .ok_or_else(|| LogError::IdsExhausted(stream.to_string()))
        }
    }

    fn deliver(
        &mut self,
        stream: &str,
        group_name: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
    ) -> LogResult<Vec<Entry>> {
        let now = Instant::now();
        let StreamState { entries, groups, .. } = self;
        let group = groups
            .get_mut(group_name)
            .ok_or_else(|| no_group(stream, group_name))?;

        match cursor {
            ReadCursor::Undelivered => {
                let batch: Vec<Entry> = entries
                    .range((Excluded(group.last_delivered), Unbounded))
                    .take(count)
                    .map(|(id, fields)| Entry::new(*id, fields.clone()))
                    .collect();
                for entry in &batch {
                    group.pending.insert(
                        entry.id,
                        PendingRecord {
                            consumer: consumer.to_string(),
                            delivered_at: now,
                            delivery_count: 1,
                        },
                    );
                }
                if let Some(last) = batch.last() {
                    group.last_delivered = last.id;
                }
                Ok(batch)
            }
            ReadCursor::Pending(after) => {
                let mut batch = Vec::new();
                for (id, record) in group.pending.range_mut((Excluded(after), Unbounded)) {
                    if batch.len() >= count {
                        break;
                    }
                    if record.consumer != consumer {
                        continue;
                    }
                    if let Some(fields) = entries.get(id) {
                        record.delivered_at = now;
                        record.delivery_count += 1;
                        batch.push(Entry::new(*id, fields.clone()));
                    }
                }
                Ok(batch)
            }
        }
    }
}

impl LogClient for MemoryLog {
    async fn ping(&self) -> LogResult<()> {
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(String, Bytes)]) -> LogResult<EntryId> {
        let handle = self.handle_or_create(stream);
        let id = {
            let mut state = handle.state.lock();
            let id = state.next_id(stream)?;
            state.entries.insert(id, fields.to_vec());
            state.last_id = id;
            id
        };
        handle.appended.notify_waiters();
        trace!(stream, %id, "memory log appended entry");
        Ok(id)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> LogResult<()> {
        let handle = self.handle_or_create(stream);
        let mut state = handle.state.lock();
        if state.groups.contains_key(group) {
            return Err(LogError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }
        let last_delivered = match start {
            StartPosition::Latest => state.last_id,
            StartPosition::Beginning => EntryId::MIN,
            StartPosition::At(id) => id,
        };
        state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
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
        let handle = self.handle(stream).ok_or_else(|| no_group(stream, group))?;
        let count = count.max(1);
        let deadline = match block {
            Block::For(duration) => Some(Instant::now() + duration),
            Block::NoWait | Block::Forever => None,
        };

        loop {
            // register before looking so an append between the check and the
            // wait still wakes us
            let notified = handle.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = handle.state.lock();
                let batch = state.deliver(stream, group, consumer, cursor, count)?;
                let history = matches!(cursor, ReadCursor::Pending(_));
                if !batch.is_empty() || history || block == Block::NoWait {
                    return Ok(batch);
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(Vec::new());
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn acknowledge(&self, stream: &str, group: &str, id: &EntryId) -> LogResult<bool> {
        let Some(handle) = self.handle(stream) else {
            return Ok(false);
        };
        let mut state = handle.state.lock();
        Ok(state
            .groups
            .get_mut(group)
            .map(|group| group.pending.remove(id).is_some())
            .unwrap_or(false))
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
        let handle = self.handle(stream).ok_or_else(|| no_group(stream, group))?;
        let mut state = handle.state.lock();
        let now = Instant::now();
        let StreamState { entries, groups, .. } = &mut *state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))?;

        let count = count.max(1);
        let max_scan = count.saturating_mul(CLAIM_SCAN_FACTOR);
        let window: Vec<EntryId> = group_state
            .pending
            .range(*start..)
            .take(max_scan + 1)
            .map(|(id, _)| *id)
            .collect();

        let mut batch = ClaimBatch::default();
        for (scanned, id) in window.iter().enumerate() {
            if batch.entries.len() >= count || scanned >= max_scan {
                batch.next_cursor = *id;
                break;
            }
            let Some(record) = group_state.pending.get_mut(id) else {
                continue;
            };
            if now.saturating_duration_since(record.delivered_at) < min_idle {
                continue;
            }
            match entries.get(id) {
                Some(fields) => {
                    record.consumer = consumer.to_string();
                    record.delivered_at = now;
                    record.delivery_count += 1;
                    batch.entries.push(Entry::new(*id, fields.clone()));
                }
                None => {
                    group_state.pending.remove(id);
                    batch.deleted.push(*id);
                }
            }
        }
        Ok(batch)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        start: &EntryId,
        count: usize,
    ) -> LogResult<Vec<PendingEntry>> {
        let handle = self.handle(stream).ok_or_else(|| no_group(stream, group))?;
        let state = handle.state.lock();
        let group_state = state
            .groups
            .get(group)
            .ok_or_else(|| no_group(stream, group))?;
        let now = Instant::now();
        Ok(group_state
            .pending
            .range(*start..)
            .take(count)
            .map(|(id, record)| PendingEntry {
                id: *id,
                consumer: record.consumer.clone(),
                idle: now.saturating_duration_since(record.delivered_at),
                delivery_count: record.delivery_count,
            })
            .collect())
    }
}
