use crate::{Block, BlockHash, Height};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A block identified by hash and height, e.g. the chain tip or the best known header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChainTip {
    pub hash: BlockHash,
    pub height: Height,
}

impl ChainTip {
    pub fn new(hash: BlockHash, height: Height) -> Self {
        Self { hash, height }
    }
}

impl fmt::Display for ChainTip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash.short(), self.height)
    }
}

/// Blocks that left and joined the main chain when the tip switched branches.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ReorgInfo {
    /// Former main-chain blocks, tip first.
    pub disconnected: Vec<Block>,
    /// New main-chain blocks, lowest first.
    pub connected: Vec<Block>,
}

impl ReorgInfo {
    /// Number of blocks rolled back.
    pub fn depth(&self) -> usize {
        self.disconnected.len()
    }
}
