use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::LogError;

/// Identifier the log assigns to an entry at append time.
///
/// Ids are `(milliseconds, sequence)` pairs ordered lexicographically, the
/// same shape Redis Streams uses, and render as `ms-seq`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    /// Lowest possible id, also the "scan finished" cursor of a claim.
    pub const MIN: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Smallest id strictly greater than `self`, `None` for the last
    /// possible id.
    pub fn next(&self) -> Option<EntryId> {
        match self.seq.checked_add(1) {
            Some(seq) => Some(EntryId { ms: self.ms, seq }),
            None => Some(EntryId {
                ms: self.ms.checked_add(1)?,
                seq: 0,
            }),
        }
    }

    pub fn is_min(&self) -> bool {
        *self == EntryId::MIN
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = LogError;

    /// Accepts `ms-seq` or a bare `ms` (sequence 0).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LogError::InvalidEntryId(s.to_string());
        match s.split_once('-') {
            Some((ms, seq)) => Ok(EntryId {
                ms: ms.parse().map_err(|_| invalid())?,
                seq: seq.parse().map_err(|_| invalid())?,
            }),
            None => Ok(EntryId {
                ms: s.parse().map_err(|_| invalid())?,
                seq: 0,
            }),
        }
    }
}
