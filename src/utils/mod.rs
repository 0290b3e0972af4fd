pub use completion_counter::CompletionCounter;
pub use progress::ProgressInterval;
pub use retry::RetryBudget;

mod completion_counter;
mod progress;
mod retry;
