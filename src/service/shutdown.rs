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

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

/// Sending side of the run-wide stop, held by the supervisor.
///
/// Only listeners subscribed before [`StopSignal::trigger`] observe it.
#[derive(Debug, Clone)]
pub struct StopSignal {
    sender: broadcast::Sender<()>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        StopSignal { sender }
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            receiver: self.sender.subscribe(),
            stopped: false,
        }
    }

    /// Stop every listener, returns how many were still attached.
    pub fn trigger(&self) -> usize {
        self.sender.send(()).unwrap_or(0)
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A worker's end of the [`StopSignal`].
///
/// A stop is sticky: once seen, [`Shutdown::stopped`] resolves at once. A
/// dropped `StopSignal` counts as a stop.
#[derive(Debug)]
pub struct Shutdown {
    receiver: broadcast::Receiver<()>,
    stopped: bool,
}

impl Shutdown {
    /// Non-blocking check, also picks up a stop nobody awaited yet.
    pub fn is_stopped(&mut self) -> bool {
        if !self.stopped {
            self.stopped = !matches!(self.receiver.try_recv(), Err(TryRecvError::Empty));
        }
        self.stopped
    }

    /// Resolves once the run is stopping.
    pub async fn stopped(&mut self) {
        if !self.stopped {
            // lagged or closed carries the same news as a message
            let _ = self.receiver.recv().await;
            self.stopped = true;
        }
    }
}
