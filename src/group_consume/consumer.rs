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

use tracing::{debug, info, warn};

use super::{Delivery, EntryProcessor, GroupMember, InFlight};
use crate::log::{Block, EntryId, LogClient, LogError, ReadCursor, StartPosition};
use crate::service::{ClaimConfig, Metrics, Shutdown};
use crate::utils::{CompletionCounter, RetryBudget};
use crate::AppResult;

/// Reads entries through the group's undelivered cursor, processes and
/// acknowledges them until the shared counter reaches its target.
pub struct GroupConsumer<L, P> {
    member: GroupMember<L, P>,
    start: StartPosition,
    block: Block,
    read_count: usize,
    max_retry: u32,
    replay_own_pending: bool,
}

impl<L, P> GroupConsumer<L, P>
where
    L: LogClient,
    P: EntryProcessor,
{
    pub fn new(
        log: Arc<L>,
        processor: P,
        counter: Arc<CompletionCounter>,
        config: &ClaimConfig,
    ) -> AppResult<Self> {
        Ok(GroupConsumer {
            member: GroupMember {
                log,
                processor,
                counter,
                metrics: Metrics::new(),
                stream: config.stream.key.clone(),
                group: config.stream.group.clone(),
                identity: config.consumer.identity.clone(),
                role: "consumer",
                progress: config.telemetry.progress(),
            },
            start: config.stream.start_position()?,
            block: config.consumer.block(),
            read_count: config.consumer.read_count,
            max_retry: config.retry.max_retry,
            replay_own_pending: config.consumer.replay_own_pending,
        })
    }

    pub fn identity(&self) -> &str {
        &self.member.identity
    }

    /// Create the consumer group, creating the stream too when missing.
    /// A group that already exists is not an error.
    pub async fn ensure_group(&self) -> AppResult<()> {
        let member = &self.member;
        let mut budget = RetryBudget::new("create-group", self.max_retry, member.metrics.clone());
        loop {
            match member
                .log
                .create_group(&member.stream, &member.group, self.start)
                .await
            {
                Ok(()) => {
                    budget.record_success();
                    info!(
                        stream = %member.stream,
                        group = %member.group,
                        start = %self.start.as_arg(),
                        "consumer group created"
                    );
                    return Ok(());
                }
                Err(LogError::GroupExists { stream, group }) => {
                    budget.record_success();
                    warn!(%stream, %group, "consumer group already exists");
                    return Ok(());
                }
                Err(err) => budget.record_failure(err)?,
            }
        }
    }

    /// Consume until `target` entries have been acknowledged by any worker
    /// sharing the counter, or until shutdown. Returns how many entries this
    /// consumer acknowledged itself.
    ///
    /// A cycle is a read followed by processing and acknowledging what was
    /// read. Failed reads and acks consume the retry budget; entries already
    /// read stay in flight across retries and are not processed twice.
    pub async fn run(&self, target: u64, shutdown: &mut Shutdown) -> AppResult<u64> {
        let member = &self.member;
        let mut budget = RetryBudget::new("read+ack", self.max_retry, member.metrics.clone());
        let mut in_flight: VecDeque<InFlight> = VecDeque::new();
        let mut acknowledged = 0u64;
        let mut cursor = if self.replay_own_pending {
            ReadCursor::Pending(EntryId::MIN)
        } else {
            ReadCursor::Undelivered
        };

        info!(
            consumer = %member.identity,
            stream = %member.stream,
            group = %member.group,
            target_count = target,
            "consumer started"
        );

        loop {
            if in_flight.is_empty() {
                if member.counter.reached(target) {
                    break;
                }
                // history reads return at once, only the undelivered cursor blocks
                let block = match cursor {
                    ReadCursor::Pending(_) => Block::NoWait,
                    ReadCursor::Undelivered => self.block,
                };
                let read = tokio::select! {
                    read = member.log.read_group(
                        &member.stream,
                        &member.group,
                        &member.identity,
                        cursor,
                        block,
                        self.read_count,
                    ) => read,
                    _ = member.counter.wait_for(target) => break,
                    _ = shutdown.stopped() => {
                        debug!(consumer = %member.identity, "consumer received shutdown");
                        break;
                    }
                };

                match read {
                    Ok(entries) => {
                        let delivery = match cursor {
                            ReadCursor::Pending(_) => {
                                match entries.last() {
                                    Some(last) => cursor = ReadCursor::Pending(last.id),
                                    None => {
                                        info!(consumer = %member.identity, "own pending entries replayed");
                                        cursor = ReadCursor::Undelivered;
                                    }
                                }
                                Delivery::Replayed
                            }
                            ReadCursor::Undelivered => Delivery::Fresh,
                        };
                        in_flight.extend(entries.into_iter().map(|e| InFlight::new(e, delivery)));
                    }
                    Err(err) => {
                        budget.record_failure(err)?;
                        continue;
                    }
                }
            }

            match member.settle(&mut in_flight, &mut acknowledged).await {
                Ok(()) => {
                    budget.record_success();
                }
                Err(err) => budget.record_failure(err)?,
            }
        }

        info!(
            consumer = %member.identity,
            acknowledged,
            completed = member.counter.get(),
            "consumer stopped"
        );
        Ok(acknowledged)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use rstest::{fixture, rstest};

    use super::*;
    use crate::log::{Entry, FaultyLog, LogOperation, MemoryLog};
    use crate::service::{setup_local_tracing, StopSignal};
    use crate::AppError;

    #[fixture]
    #[once]
    fn setup() {
        setup_local_tracing().expect("failed to setup tracing");
    }

    fn config(max_retry: u32) -> ClaimConfig {
        let mut config = ClaimConfig::default();
        config.stream.key = "orders".to_string();
        config.stream.group = "billing".to_string();
        config.stream.group_start = "0".to_string();
        config.retry.max_retry = max_retry;
        config
    }

    fn fields(i: u64) -> Vec<(String, Bytes)> {
        vec![("message".to_string(), Bytes::from(format!("Message ID: {i}")))]
    }

    fn shutdown_pair() -> (StopSignal, Shutdown) {
        let stop = StopSignal::new();
        let shutdown = stop.subscribe();
        (stop, shutdown)
    }

    #[derive(Clone, Default)]
    struct Counting(Arc<AtomicU32>);

    impl EntryProcessor for Counting {
        async fn process(&self, _entry: &Entry, _delivery: Delivery) -> AppResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Acks each entry itself before returning, so the consumer's own ack
    /// finds nothing to remove.
    #[derive(Clone)]
    struct AckingBehind(Arc<MemoryLog>);

    impl EntryProcessor for AckingBehind {
        async fn process(&self, entry: &Entry, _delivery: Delivery) -> AppResult<()> {
            self.0.acknowledge("orders", "billing", &entry.id).await?;
            Ok(())
        }
    }

    #[derive(Clone)]
    struct Failing;

    impl EntryProcessor for Failing {
        async fn process(&self, _entry: &Entry, _delivery: Delivery) -> AppResult<()> {
            Err(AppError::Processing("downstream unavailable".to_string()))
        }
    }

    #[rstest]
    #[tokio::test]
    async fn ensure_group_twice_is_ok(_setup: ()) {
        let log = Arc::new(MemoryLog::new());
        let consumer = GroupConsumer::new(
            log.clone(),
            Counting::default(),
            Arc::new(CompletionCounter::new()),
            &config(3),
        )
        .unwrap();

        consumer.ensure_group().await.unwrap();
        consumer.ensure_group().await.unwrap();
        assert!(log.is_empty("orders"));
    }

    #[rstest]
    #[tokio::test]
    async fn consumes_until_target(_setup: ()) {
        let log = Arc::new(MemoryLog::new());
        let counter = Arc::new(CompletionCounter::new());
        let processor = Counting::default();
        let consumer =
            GroupConsumer::new(log.clone(), processor.clone(), counter.clone(), &config(3))
                .unwrap();
        consumer.ensure_group().await.unwrap();
        for i in 0..5 {
            log.append("orders", &fields(i)).await.unwrap();
        }

        let (_stop, mut shutdown) = shutdown_pair();
        let acknowledged = consumer.run(3, &mut shutdown).await.unwrap();

        assert_eq!(acknowledged, 3);
        assert_eq!(counter.get(), 3);
        assert_eq!(processor.0.load(Ordering::SeqCst), 3);
        let pending = log.pending("orders", "billing", &EntryId::MIN, 10).await.unwrap();
        assert!(pending.is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn zero_target_returns_immediately(_setup: ()) {
        let log = Arc::new(MemoryLog::new());
        let consumer = GroupConsumer::new(
            log,
            Counting::default(),
            Arc::new(CompletionCounter::new()),
            &config(3),
        )
        .unwrap();
        let (_stop, mut shutdown) = shutdown_pair();
        assert_eq!(consumer.run(0, &mut shutdown).await.unwrap(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn stops_when_counter_reached_elsewhere(_setup: ()) {
        let log = Arc::new(MemoryLog::new());
        let counter = Arc::new(CompletionCounter::new());
        let consumer = GroupConsumer::new(
            log.clone(),
            Counting::default(),
            counter.clone(),
            &config(3),
        )
        .unwrap();
        consumer.ensure_group().await.unwrap();

        let (_stop, mut shutdown) = shutdown_pair();
        let bump = {
            let counter = counter.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.increment();
            })
        };
        // blocks forever on the empty stream until the counter moves
        let acknowledged = consumer.run(1, &mut shutdown).await.unwrap();
        bump.await.unwrap();
        assert_eq!(acknowledged, 0);
    }

    #[rstest]
    #[tokio::test]
    async fn stops_on_shutdown(_setup: ()) {
        let log = Arc::new(MemoryLog::new());
        let consumer = GroupConsumer::new(
            log,
            Counting::default(),
            Arc::new(CompletionCounter::new()),
            &config(3),
        )
        .unwrap();
        consumer.ensure_group().await.unwrap();

        let (stop, mut shutdown) = shutdown_pair();
        let signal = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stop.trigger();
        });
        assert_eq!(consumer.run(10, &mut shutdown).await.unwrap(), 0);
        signal.await.unwrap();
    }

    #[rstest]
    #[tokio::test]
    async fn ack_that_removes_nothing_does_not_count(_setup: ()) {
        let log = Arc::new(MemoryLog::new());
        let counter = Arc::new(CompletionCounter::new());
        let consumer = GroupConsumer::new(
            log.clone(),
            AckingBehind(log.clone()),
            counter.clone(),
            &config(3),
        )
        .unwrap();
        consumer.ensure_group().await.unwrap();
        log.append("orders", &fields(0)).await.unwrap();

        let (stop, mut shutdown) = shutdown_pair();
        let stop = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.trigger();
        });
        let acknowledged = consumer.run(1, &mut shutdown).await.unwrap();
        stop.await.unwrap();

        assert_eq!(acknowledged, 0);
        assert_eq!(counter.get(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn failed_processing_leaves_entry_pending(_setup: ()) {
        let log = Arc::new(MemoryLog::new());
        let counter = Arc::new(CompletionCounter::new());
        let consumer =
            GroupConsumer::new(log.clone(), Failing, counter.clone(), &config(3)).unwrap();
        consumer.ensure_group().await.unwrap();
        let id = log.append("orders", &fields(0)).await.unwrap();

        let (stop, mut shutdown) = shutdown_pair();
        let stop = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.trigger();
        });
        assert_eq!(consumer.run(1, &mut shutdown).await.unwrap(), 0);
        stop.await.unwrap();

        let pending = log.pending("orders", "billing", &EntryId::MIN, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].consumer, "consumer-1");
        assert_eq!(counter.get(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn ack_failure_retried_without_reprocessing(_setup: ()) {
        let log = Arc::new(FaultyLog::new(MemoryLog::new()));
        log.fail_next(LogOperation::Acknowledge, 2);
        let counter = Arc::new(CompletionCounter::new());
        let processor = Counting::default();
        let consumer =
            GroupConsumer::new(log.clone(), processor.clone(), counter.clone(), &config(3))
                .unwrap();
        consumer.ensure_group().await.unwrap();
        log.append("orders", &fields(0)).await.unwrap();

        let (_stop, mut shutdown) = shutdown_pair();
        assert_eq!(consumer.run(1, &mut shutdown).await.unwrap(), 1);
        assert_eq!(processor.0.load(Ordering::SeqCst), 1);
        assert_eq!(counter.get(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn ack_failures_exhaust_budget(_setup: ()) {
        let log = Arc::new(FaultyLog::new(MemoryLog::new()));
        log.fail_next(LogOperation::Acknowledge, 3);
        let consumer = GroupConsumer::new(
            log.clone(),
            Counting::default(),
            Arc::new(CompletionCounter::new()),
            &config(3),
        )
        .unwrap();
        consumer.ensure_group().await.unwrap();
        log.append("orders", &fields(0)).await.unwrap();

        let (_stop, mut shutdown) = shutdown_pair();
        let err = consumer.run(1, &mut shutdown).await.unwrap_err();
        assert!(err.is_retry_exhausted());
    }

    #[rstest]
    #[case::recovers(2, true)]
    #[case::exhausts(3, false)]
    #[tokio::test]
    async fn read_failures_consume_the_budget(
        _setup: (),
        #[case] failures: u32,
        #[case] recovers: bool,
    ) {
        let log = Arc::new(FaultyLog::new(MemoryLog::new()));
        let counter = Arc::new(CompletionCounter::new());
        let processor = Counting::default();
        let consumer =
            GroupConsumer::new(log.clone(), processor.clone(), counter.clone(), &config(3))
                .unwrap();
        consumer.ensure_group().await.unwrap();
        log.append("orders", &fields(0)).await.unwrap();
        log.fail_next(LogOperation::ReadGroup, failures);

        let (_stop, mut shutdown) = shutdown_pair();
        let result = consumer.run(1, &mut shutdown).await;

        if recovers {
            assert_eq!(result.unwrap(), 1);
            assert_eq!(processor.0.load(Ordering::SeqCst), 1);
            assert_eq!(counter.get(), 1);
        } else {
            assert!(matches!(
                result,
                Err(AppError::RetryExhausted {
                    operation: "read+ack",
                    attempts: 3,
                    ..
                })
            ));
            assert_eq!(processor.0.load(Ordering::SeqCst), 0);
            // nothing was read, so nothing is pending either
            let pending = log.pending("orders", "billing", &EntryId::MIN, 10).await.unwrap();
            assert!(pending.is_empty());
        }
    }

    #[rstest]
    #[tokio::test]
    async fn replays_own_pending_before_new_entries(_setup: ()) {
        let log = Arc::new(MemoryLog::new());
        let mut config = config(3);
        config.consumer.replay_own_pending = true;
        let counter = Arc::new(CompletionCounter::new());

        #[derive(Clone, Default)]
        struct Recording(Arc<parking_lot::Mutex<Vec<(EntryId, Delivery)>>>);
        impl EntryProcessor for Recording {
            async fn process(&self, entry: &Entry, delivery: Delivery) -> AppResult<()> {
                self.0.lock().push((entry.id, delivery));
                Ok(())
            }
        }

        let recording = Recording::default();
        let consumer =
            GroupConsumer::new(log.clone(), recording.clone(), counter.clone(), &config).unwrap();
        consumer.ensure_group().await.unwrap();

        let first = log.append("orders", &fields(0)).await.unwrap();
        // an earlier incarnation read the entry and died before acking
        log.read_group(
            "orders",
            "billing",
            "consumer-1",
            ReadCursor::Undelivered,
            Block::NoWait,
            1,
        )
        .await
        .unwrap();
        let second = log.append("orders", &fields(1)).await.unwrap();

        let (_stop, mut shutdown) = shutdown_pair();
        assert_eq!(consumer.run(2, &mut shutdown).await.unwrap(), 2);
        assert_eq!(
            *recording.0.lock(),
            vec![(first, Delivery::Replayed), (second, Delivery::Fresh)]
        );
    }
}
