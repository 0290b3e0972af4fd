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

use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::log::LogError;
use crate::service::Metrics;
use crate::{AppError, AppResult};

/// Attempt bookkeeping for one logical operation (an append, a read+ack
/// cycle, a claim+ack pass).
///
/// Attempts are retried immediately, there is no backoff. After
/// `max_retry` failed attempts the next failure is fatal and comes back as
/// [`AppError::RetryExhausted`].
#[derive(Debug)]
pub struct RetryBudget {
    operation: &'static str,
    max_retry: u32,
    failures: u32,
    first_failure: Option<Instant>,
    metrics: Metrics,
}

impl RetryBudget {
    pub fn new(operation: &'static str, max_retry: u32, metrics: Metrics) -> Self {
        Self {
            operation,
            max_retry: max_retry.max(1),
            failures: 0,
            first_failure: None,
            metrics,
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failed attempt. `Ok(())` means another attempt is allowed.
    pub fn record_failure(&mut self, err: LogError) -> AppResult<()> {
        self.failures += 1;
        self.first_failure.get_or_insert_with(Instant::now);
        self.metrics.retry_failed(self.operation);

        if self.failures >= self.max_retry {
            return Err(AppError::RetryExhausted {
                operation: self.operation,
                attempts: self.failures,
                source: err,
            });
        }
        warn!(
            operation = self.operation,
            attempt = self.failures,
            max_retry = self.max_retry,
            error = %err,
            "transient log error, retrying"
        );
        Ok(())
    }

    /// Record a successful attempt and reset the budget.
    ///
    /// Returns the time elapsed since the first failed attempt when the
    /// operation had to be retried.
    pub fn record_success(&mut self) -> Option<Duration> {
        let recovered_after = self.first_failure.take().map(|first| first.elapsed());
        if let Some(latency) = recovered_after {
            warn!(
                operation = self.operation,
                attempts = self.failures + 1,
                latency_ms = latency.as_millis() as u64,
                "recovered from transient log errors"
            );
            self.metrics.retry_recovered(self.operation, latency);
        }
        self.failures = 0;
        recovered_after
    }
}
