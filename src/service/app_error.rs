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

use crate::log::LogError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("telemetry setup error: {0}")]
    Telemetry(String),

    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    /// log client errors on call sites that do not retry
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// every attempt of one logical operation failed, fatal for the worker
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: LogError,
    },

    /// an entry processor rejected an entry, the entry stays pending
    #[error("processing error: {0}")]
    Processing(String),
}

impl AppError {
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, AppError::RetryExhausted { .. })
    }
}
