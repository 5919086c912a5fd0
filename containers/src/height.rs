use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a block in the chain; genesis is height 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Height(pub u64);

impl Height {
    pub const GENESIS: Height = Height(0);

    pub fn next(self) -> Height {
        Height(self.0 + 1)
    }

    /// Height of the parent block, saturating at genesis.
    pub fn prev(self) -> Height {
        Height(self.0.saturating_sub(1))
    }

    pub fn distance_to(self, other: Height) -> u64 {
        self.0.abs_diff(other.0)
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prev_saturates_at_genesis() {
        assert_eq!(Height::GENESIS.prev(), Height::GENESIS);
        assert_eq!(Height(10).prev(), Height(9));
        assert_eq!(Height(10).next(), Height(11));
    }

    #[test]
    fn test_distance_is_symmetric() {
        assert_eq!(Height(3).distance_to(Height(10)), 7);
        assert_eq!(Height(10).distance_to(Height(3)), 7);
    }
}
