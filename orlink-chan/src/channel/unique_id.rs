//! Helper for unique identifiers for channels.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for allocating unique identifiers for channels.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a channel.
///
/// These identifiers are assigned monotonically and are unique for
/// the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqId(u64);

impl UniqId {
    /// Construct a new UniqId.
    pub(crate) fn new() -> Self {
        // Relaxed ordering is fine; we don't care about how this
        // is instantiated with respect to other channels.
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        assert!(id != u64::MAX, "Exhausted the channel ID namespace");
        UniqId(id)
    }
}

impl Display for UniqId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Chan {}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chan_unique_id() {
        let ids: Vec<UniqId> = (0..10).map(|_| UniqId::new()).collect();

        // Make sure we got distinct, increasing numbers.
        let mut all_nums: Vec<_> = ids.iter().map(|x| x.0).collect();
        assert!(all_nums.windows(2).all(|w| w[0] < w[1]));
        all_nums.dedup();
        assert_eq!(all_nums.len(), ids.len());

        assert_eq!(format!("{}", ids[3]), format!("Chan {}", ids[3].0));
    }
}
