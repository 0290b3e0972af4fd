//! Appending the synthetic workload to the log.

mod publisher;

pub use publisher::{message_fields, AppendOutcome, PublishSummary, Publisher};
