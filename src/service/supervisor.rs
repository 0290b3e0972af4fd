use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{error, info, trace, warn};

use crate::group_consume::{EntryProcessor, GroupConsumer, Reclaimer};
use crate::log::LogClient;
use crate::produce::Publisher;
use crate::service::{AppError, AppResult, ClaimConfig, StopSignal};
use crate::utils::CompletionCounter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Worker {
    Publisher,
    Consumer,
    Reclaimer,
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Worker::Publisher => "publisher",
            Worker::Consumer => "consumer",
            Worker::Reclaimer => "reclaimer",
        };
        f.write_str(name)
    }
}

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub published: u64,
    pub by_consumer: u64,
    pub by_reclaimer: u64,
    /// the shared completion counter at shutdown
    pub acknowledged: u64,
    pub interrupted: bool,
    /// from the connectivity check to the last worker stopping
    pub elapsed: Duration,
}

/// Runs the publisher, the group consumer and the reclaimer against one log
/// until the consumer reaches the target count, a worker fails fatally, or
/// the process is interrupted.
pub struct Supervisor<L, P> {
    log: Arc<L>,
    config: ClaimConfig,
    processor: P,
}

impl<L, P> Supervisor<L, P>
where
    L: LogClient,
    P: EntryProcessor,
{
    pub fn new(log: Arc<L>, config: ClaimConfig, processor: P) -> Self {
        Supervisor {
            log,
            config,
            processor,
        }
    }

    /// Run until done or Ctrl-C.
    pub async fn run(&self) -> AppResult<RunSummary> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(cause = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until done or until `interrupt` completes.
    ///
    /// The first fatal worker error shuts the other workers down and is
    /// returned once all of them stopped.
    pub async fn run_until<F>(&self, interrupt: F) -> AppResult<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        self.log.ping().await?;
        info!("log reachable: PONG");

        let counter = Arc::new(CompletionCounter::new());
        let target = self.config.target_count();

        let consumer = GroupConsumer::new(
            self.log.clone(),
            self.processor.clone(),
            counter.clone(),
            &self.config,
        )?;
        consumer.ensure_group().await?;
        let reclaimer = Reclaimer::new(
            self.log.clone(),
            self.processor.clone(),
            counter.clone(),
            &self.config,
        );
        let publisher = Publisher::new(self.log.clone(), &self.config);
        let message_count = self.config.stream.message_count;

        let stop = StopSignal::new();
        let (exit_tx, mut exit_rx) = mpsc::channel(3);

        let mut shutdown = stop.subscribe();
        spawn_worker(Worker::Publisher, exit_tx.clone(), async move {
            publisher
                .publish(message_count, &mut shutdown)
                .await
                .map(|summary| summary.appended)
        });
        let mut shutdown = stop.subscribe();
        spawn_worker(Worker::Consumer, exit_tx.clone(), async move {
            consumer.run(target, &mut shutdown).await
        });
        let mut shutdown = stop.subscribe();
        spawn_worker(Worker::Reclaimer, exit_tx, async move {
            reclaimer.run(&mut shutdown).await
        });

        let mut summary = RunSummary::default();
        let mut first_error: Option<(Worker, AppError)> = None;
        let mut running = 3;
        tokio::pin!(interrupt);

        while running > 0 {
            tokio::select! {
                exit = exit_rx.recv() => {
                    let Some((worker, result)) = exit else {
                        break;
                    };
                    running -= 1;
                    match result {
                        Ok(count) => {
                            trace!(%worker, count, "worker finished");
                            match worker {
                                Worker::Publisher => summary.published = count,
                                Worker::Consumer => {
                                    summary.by_consumer = count;
                                    if counter.reached(target) {
                                        info!(target_count = target, "target count reached, shutting down");
                                    }
                                    stop.trigger();
                                }
                                Worker::Reclaimer => summary.by_reclaimer = count,
                            }
                        }
                        Err(err) => {
                            error!(%worker, cause = %err, "worker failed, shutting down");
                            if first_error.is_none() {
                                first_error = Some((worker, err));
                            }
                            stop.trigger();
                        }
                    }
                }
                _ = &mut interrupt, if !summary.interrupted => {
                    info!("get shutdown signal");
                    summary.interrupted = true;
                    stop.trigger();
                }
            }
        }

        summary.acknowledged = counter.get();
        summary.elapsed = started.elapsed();
        if let Some((worker, err)) = first_error {
            error!(%worker, cause = %err, elapsed = ?summary.elapsed, "run aborted");
            return Err(err);
        }
        if summary.interrupted && summary.acknowledged < target {
            warn!(
                acknowledged = summary.acknowledged,
                target_count = target,
                "interrupted before reaching the target"
            );
        }
        info!(
            published = summary.published,
            by_consumer = summary.by_consumer,
            by_reclaimer = summary.by_reclaimer,
            acknowledged = summary.acknowledged,
            "run complete, all process finished in {:?}",
            summary.elapsed
        );
        Ok(summary)
    }
}

/// Spawn `task` and report its result, or its panic, on `exit_tx`.
fn spawn_worker<F>(worker: Worker, exit_tx: mpsc::Sender<(Worker, AppResult<u64>)>, task: F)
where
    F: Future<Output = AppResult<u64>> + Send + 'static,
{
    let handle = tokio::spawn(task);
    tokio::spawn(async move {
        let result = match handle.await {
            Ok(result) => result,
            Err(join_error) => Err(AppError::WorkerPanicked(format!(
                "{worker}: {}",
                panic_message(join_error)
            ))),
        };
        let _ = exit_tx.send((worker, result)).await;
    });
}

fn panic_message(join_error: JoinError) -> String {
    if !join_error.is_panic() {
        return "task cancelled".to_string();
    }
    let payload = join_error.into_panic();
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked with an unknown payload type".to_string()
    }
}
