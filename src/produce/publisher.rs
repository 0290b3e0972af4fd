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

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use crate::log::{EntryId, LogClient};
use crate::service::{ClaimConfig, Metrics, Shutdown};
use crate::utils::{ProgressInterval, RetryBudget};
use crate::AppResult;

/// Fields of the `index`-th workload entry.
pub fn message_fields(index: u64) -> Vec<(String, Bytes)> {
    vec![
        (
            "message".to_string(),
            Bytes::from(format!("Message ID: {index}")),
        ),
        ("seq".to_string(), Bytes::from(index.to_string())),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub index: u64,
    pub id: EntryId,
    /// attempts it took, 1 when the first append went through
    pub attempts: u32,
    /// time from the first failed attempt to the successful one
    pub recovered_after: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub appended: u64,
    /// appends that needed more than one attempt
    pub retried: u64,
    pub last_id: Option<EntryId>,
}

/// Appends numbered entries to one stream, retrying each append within the
/// retry budget.
pub struct Publisher<L> {
    log: Arc<L>,
    stream: String,
    max_retry: u32,
    progress: ProgressInterval,
    metrics: Metrics,
}

impl<L: LogClient> Publisher<L> {
    pub fn new(log: Arc<L>, config: &ClaimConfig) -> Self {
        Publisher {
            log,
            stream: config.stream.key.clone(),
            max_retry: config.retry.max_retry,
            progress: config.telemetry.progress(),
            metrics: Metrics::new(),
        }
    }

    /// Append entry `index`, retrying transient failures.
    ///
    /// An append whose reply was lost may still have landed, so a retried
    /// entry can appear twice in the log. Consumers must tolerate that.
    pub async fn publish_one(&self, index: u64) -> AppResult<AppendOutcome> {
        let fields = message_fields(index);
        let mut budget = RetryBudget::new("append", self.max_retry, self.metrics.clone());
        loop {
            match self.log.append(&self.stream, &fields).await {
                Ok(id) => {
                    let attempts = budget.failures() + 1;
                    let recovered_after = budget.record_success();
                    self.metrics.entry_appended();
                    if self.progress.is_tick(index) {
                        info!(%id, "Send Message: \"Message ID: {}\"", index);
                    } else {
                        debug!(%id, index, attempts, "entry appended");
                    }
                    return Ok(AppendOutcome {
                        index,
                        id,
                        attempts,
                        recovered_after,
                    });
                }
                Err(err) => budget.record_failure(err)?,
            }
        }
    }

    /// Append entries `0..count` in order, stopping early on shutdown.
    pub async fn publish(&self, count: u64, shutdown: &mut Shutdown) -> AppResult<PublishSummary> {
        let mut summary = PublishSummary::default();
        for index in 0..count {
            let outcome = tokio::select! {
                biased;
                _ = shutdown.stopped() => {
                    debug!(appended = summary.appended, "publisher received shutdown");
                    break;
                }
                outcome = self.publish_one(index) => outcome?,
            };
            summary.appended += 1;
            if outcome.attempts > 1 {
                summary.retried += 1;
            }
            summary.last_id = Some(outcome.id);
        }
        info!(
            stream = %self.stream,
            appended = summary.appended,
            retried = summary.retried,
            "publisher finished"
        );
        Ok(summary)
    }
}
