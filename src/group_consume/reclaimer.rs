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

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Delivery, EntryProcessor, GroupMember, InFlight};
use crate::log::{EntryId, LogClient};
use crate::service::{ClaimConfig, Metrics, Shutdown};
use crate::utils::{CompletionCounter, RetryBudget};
use crate::AppResult;

/// Scan position carried between reclaim passes.
#[derive(Debug, Default)]
pub struct ReclaimState {
    cursor: EntryId,
    held: VecDeque<InFlight>,
}

impl ReclaimState {
    pub fn cursor(&self) -> EntryId {
        self.cursor
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassOutcome {
    pub claimed: usize,
    pub acknowledged: u64,
    /// pending ids dropped because their entries were deleted from the log
    pub deleted: usize,
    pub next_cursor: EntryId,
}

/// Periodically takes over entries that sat unacknowledged in the PEL for
/// longer than the idle threshold, processes and acknowledges them.
pub struct Reclaimer<L, P> {
    member: GroupMember<L, P>,
    idle_threshold: Duration,
    batch_size: usize,
    idle_pause: Duration,
    max_retry: u32,
}

impl<L, P> Reclaimer<L, P>
where
    L: LogClient,
    P: EntryProcessor,
{
    pub fn new(
        log: Arc<L>,
        processor: P,
        counter: Arc<CompletionCounter>,
        config: &ClaimConfig,
    ) -> Self {
        Reclaimer {
            member: GroupMember {
                log,
                processor,
                counter,
                metrics: Metrics::new(),
                stream: config.stream.key.clone(),
                group: config.stream.group.clone(),
                identity: config.reclaimer.identity.clone(),
                role: "reclaimer",
                progress: config.telemetry.progress(),
            },
            idle_threshold: config.reclaimer.idle_threshold(),
            batch_size: config.reclaimer.batch_size,
            idle_pause: config.reclaimer.idle_pause(),
            max_retry: config.retry.max_retry,
        }
    }

    /// One claim followed by processing and acknowledging what was claimed.
    ///
    /// A failed ack is retried without claiming again, the entries already
    /// claimed stay held in `state`. The cursor only advances once the whole
    /// pass succeeded.
    pub async fn pass(&self, state: &mut ReclaimState) -> AppResult<PassOutcome> {
        let member = &self.member;
        let mut budget = RetryBudget::new("claim+ack", self.max_retry, member.metrics.clone());
        let mut outcome = PassOutcome::default();
        let mut claimed = false;

        loop {
            if !claimed {
                match member
                    .log
                    .claim_stale(
                        &member.stream,
                        &member.group,
                        &member.identity,
                        self.idle_threshold,
                        &state.cursor,
                        self.batch_size,
                    )
                    .await
                {
                    Ok(batch) => {
                        claimed = true;
                        outcome.claimed = batch.entries.len();
                        outcome.deleted = batch.deleted.len() + batch.missing;
                        outcome.next_cursor = batch.next_cursor;
                        if outcome.deleted > 0 {
                            warn!(
                                reclaimer = %member.identity,
                                deleted = ?batch.deleted,
                                missing = batch.missing,
                                "pending entries no longer in the log were dropped"
                            );
                        }
                        if !batch.entries.is_empty() {
                            member.metrics.entries_claimed(batch.entries.len() as u64);
                            info!(
                                reclaimer = %member.identity,
                                claimed = batch.entries.len(),
                                next_cursor = %batch.next_cursor,
                                "claimed idle entries"
                            );
                        }
                        state.held.extend(
                            batch
                                .entries
                                .into_iter()
                                .map(|entry| InFlight::new(entry, Delivery::Reclaimed)),
                        );
                    }
                    Err(err) => {
                        budget.record_failure(err)?;
                        continue;
                    }
                }
            }

            match member.settle(&mut state.held, &mut outcome.acknowledged).await {
                Ok(()) => break,
                Err(err) => budget.record_failure(err)?,
            }
        }

        budget.record_success();
        state.cursor = outcome.next_cursor;
        Ok(outcome)
    }

    /// Run passes until shutdown. Returns how many entries this reclaimer
    /// acknowledged.
    ///
    /// Passes follow each other without delay while the scan is still moving
    /// through the PEL. Once a pass claimed nothing and the scan wrapped, the
    /// reclaimer pauses for `idle_pause` before scanning again.
    pub async fn run(&self, shutdown: &mut Shutdown) -> AppResult<u64> {
        let member = &self.member;
        let mut state = ReclaimState::default();
        let mut acknowledged = 0u64;

        info!(
            reclaimer = %member.identity,
            stream = %member.stream,
            group = %member.group,
            idle_threshold_ms = self.idle_threshold.as_millis() as u64,
            "reclaimer started"
        );

        while !shutdown.is_stopped() {
            let outcome = tokio::select! {
                outcome = self.pass(&mut state) => outcome?,
                _ = shutdown.stopped() => break,
            };
            acknowledged += outcome.acknowledged;

            if outcome.claimed == 0 && outcome.next_cursor.is_min() {
                debug!(reclaimer = %member.identity, "nothing idle, pausing");
                tokio::select! {
                    _ = tokio::time::sleep(self.idle_pause) => {}
                    _ = shutdown.stopped() => break,
                }
            }
        }

        info!(reclaimer = %member.identity, acknowledged, "reclaimer stopped");
        Ok(acknowledged)
    }
}
