use crate::{BlockHash, Height};
use serde::{Deserialize, Serialize};

/// A hardcoded point in the chain's history.
///
/// Headers at a checkpoint height must hash to the checkpoint hash; this lets
/// incompatible historical chains be rejected without validating them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Height of the checkpointed block.
    pub height: Height,
    /// Hash of the checkpointed block.
    pub hash: BlockHash,
}

impl Checkpoint {
    pub fn new(height: Height, hash: BlockHash) -> Self {
        Self { height, hash }
    }

    /// Whether a block at `height` with `hash` conflicts with this checkpoint.
    pub fn conflicts_with(&self, height: Height, hash: &BlockHash) -> bool {
        self.height == height && self.hash != *hash
    }
}
