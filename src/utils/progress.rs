/// Picks which per-entry events are worth an INFO line.
///
/// Every `n`-th event is a tick, the others are logged at DEBUG. An
/// interval of 0 has no ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressInterval(u64);

impl ProgressInterval {
    pub fn new(every: u64) -> Self {
        ProgressInterval(every)
    }

    pub fn is_tick(&self, count: u64) -> bool {
        self.0 > 0 && count % self.0 == 0
    }
}
