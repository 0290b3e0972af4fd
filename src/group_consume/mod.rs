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

//! Group consumption: the consumer reading fresh entries and the reclaimer
//! recovering entries whose owner stopped acknowledging.

mod consumer;
mod processor;
mod reclaimer;

pub use consumer::GroupConsumer;
pub use processor::{Delivery, EntryProcessor, LoggingProcessor};
pub use reclaimer::{PassOutcome, ReclaimState, Reclaimer};

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::log::{Entry, LogClient, LogResult};
use crate::service::Metrics;
use crate::utils::{CompletionCounter, ProgressInterval};

/// An entry read or claimed by this worker and not yet acknowledged.
#[derive(Debug)]
struct InFlight {
    entry: Entry,
    delivery: Delivery,
    processed: bool,
}

impl InFlight {
    fn new(entry: Entry, delivery: Delivery) -> Self {
        Self {
            entry,
            delivery,
            processed: false,
        }
    }
}

/// What the consumer and the reclaimer share: a seat in one consumer group.
struct GroupMember<L, P> {
    log: Arc<L>,
    processor: P,
    counter: Arc<CompletionCounter>,
    metrics: Metrics,
    stream: String,
    group: String,
    identity: String,
    role: &'static str,
    progress: ProgressInterval,
}

impl<L, P> GroupMember<L, P>
where
    L: LogClient,
    P: EntryProcessor,
{
    /// Process and acknowledge in-flight entries front to back.
    ///
    /// Each entry is processed at most once while it stays in flight, so a
    /// failed ack retried later does not run the processor again. The counter
    /// only moves when the ack actually removed the entry from the PEL. An ack
    /// error returns early and leaves the rest in flight for the next attempt.
    async fn settle(
        &self,
        in_flight: &mut VecDeque<InFlight>,
        acknowledged: &mut u64,
    ) -> LogResult<()> {
        while let Some(front) = in_flight.front_mut() {
            if !front.processed {
                if let Err(err) = self.processor.process(&front.entry, front.delivery).await {
                    warn!(
                        role = self.role,
                        id = %front.entry.id,
                        error = %err,
                        "processing failed, entry stays pending"
                    );
                    in_flight.pop_front();
                    continue;
                }
                front.processed = true;
            }

            let id = front.entry.id;
            if self.log.acknowledge(&self.stream, &self.group, &id).await? {
                let total = self.counter.increment();
                self.metrics.entry_acknowledged(self.role);
                *acknowledged += 1;
                if self.progress.is_tick(total) {
                    let message = front.entry.field_str("message").unwrap_or("<non-utf8 payload>");
                    info!(role = self.role, %id, total, "Receive Message: \"{}\"", message);
                } else {
                    debug!(role = self.role, %id, total, "entry acknowledged");
                }
            } else {
                debug!(role = self.role, %id, "entry was no longer pending");
            }
            in_flight.pop_front();
        }
        Ok(())
    }
}
