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

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

/// Process-wide count of acknowledged entries.
///
/// Incremented by the group consumer and the reclaimer, read by the
/// consumer's termination check. Waiters parked in [`wait_for`] are woken
/// on every increment.
///
/// [`wait_for`]: CompletionCounter::wait_for
#[derive(Debug, Default)]
pub struct CompletionCounter {
    count: AtomicU64,
    changed: Notify,
}

impl CompletionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one and return the new value.
    pub fn increment(&self) -> u64 {
        let value = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        self.changed.notify_waiters();
        value
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn reached(&self, target: u64) -> bool {
        self.get() >= target
    }

    /// Resolve once the count is at least `target`.
    pub async fn wait_for(&self, target: u64) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.reached(target) {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let counter = Arc::new(CompletionCounter::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    counter.increment();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.get(), 8000);
    }

    #[tokio::test]
    async fn wait_for_returns_immediately_when_reached() {
        let counter = CompletionCounter::new();
        counter.increment();
        tokio::time::timeout(Duration::from_millis(50), counter.wait_for(1))
            .await
            .expect("target already reached");
        tokio::time::timeout(Duration::from_millis(50), counter.wait_for(0))
            .await
            .expect("zero target is always reached");
    }

    #[tokio::test]
    async fn wait_for_wakes_on_the_increment_that_reaches_target() {
        let counter = Arc::new(CompletionCounter::new());
        let waiter = {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move { counter.wait_for(3).await })
        };
        for _ in 0..3 {
            tokio::task::yield_now().await;
            counter.increment();
        }
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
        assert!(counter.reached(3));
    }
}
