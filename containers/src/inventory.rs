use crate::Bytes32;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvType {
    Tx,
    Block,
}

/// An inventory vector: announces (or requests) a single object by hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvVect {
    pub kind: InvType,
    pub hash: Bytes32,
}

impl InvVect {
    pub fn tx(hash: Bytes32) -> Self {
        Self {
            kind: InvType::Tx,
            hash,
        }
    }

    pub fn block(hash: Bytes32) -> Self {
        Self {
            kind: InvType::Block,
            hash,
        }
    }
}

impl fmt::Display for InvVect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            InvType::Tx => write!(f, "tx {}", self.hash),
            InvType::Block => write!(f, "block {}", self.hash),
        }
    }
}
