use std::future::Future;

use tracing::{debug, warn};

use crate::log::Entry;
use crate::AppResult;

/// How an entry reached the worker processing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// first delivery through the group's undelivered cursor
    Fresh,
    /// re-read from the consumer's own pending history after a restart
    Replayed,
    /// claimed from another consumer after sitting idle
    Reclaimed,
}

/// Work done for each entry before it is acknowledged.
///
/// Returning an error leaves the entry unacknowledged in the pending list,
/// where the reclaimer picks it up once it has been idle long enough. An
/// entry can therefore be processed more than once.
pub trait EntryProcessor: Clone + Send + Sync + 'static {
    fn process(
        &self,
        entry: &Entry,
        delivery: Delivery,
    ) -> impl Future<Output = AppResult<()>> + Send;
}

/// Logs each entry's `message` field. Fresh entries go to DEBUG, entries
/// seen again after a restart or a claim to WARN.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingProcessor;

impl EntryProcessor for LoggingProcessor {
    async fn process(&self, entry: &Entry, delivery: Delivery) -> AppResult<()> {
        let message = entry.field_str("message").unwrap_or("<non-utf8 payload>");
        match delivery {
            Delivery::Fresh => debug!(id = %entry.id, "Receive Message: \"{}\"", message),
            Delivery::Replayed | Delivery::Reclaimed => {
                warn!(id = %entry.id, ?delivery, "claim Message: \"{}\"", message)
            }
        }
        Ok(())
    }
}
