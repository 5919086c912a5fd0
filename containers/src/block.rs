use crate::types::double_sha256;
use crate::{BlockHash, Bytes32, Transaction};
use serde::{Deserialize, Serialize};

/// Serialized size of a block header in bytes.
pub const BLOCK_HEADER_LEN: usize = 80;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block: BlockHash,
    pub merkle_root: Bytes32,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn serialize(&self) -> [u8; BLOCK_HEADER_LEN] {
        let mut out = [0u8; BLOCK_HEADER_LEN];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.prev_block.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn hash(&self) -> BlockHash {
        double_sha256(&self.serialize())
    }

    /// The genesis header is the only one without a parent.
    pub fn is_genesis(&self) -> bool {
        self.prev_block.is_zero()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn parent_hash(&self) -> BlockHash {
        self.header.prev_block
    }

    /// Build a block whose header commits to `transactions`.
    pub fn new(mut header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        header.merkle_root = compute_merkle_root(&transactions);
        Self {
            header,
            transactions,
        }
    }

    /// Whether the header's merkle root matches the transactions carried.
    pub fn has_valid_merkle_root(&self) -> bool {
        self.header.merkle_root == compute_merkle_root(&self.transactions)
    }
}

/// Merkle root over transaction hashes. An odd node at any level is paired with
/// itself; an empty list commits to the zero hash.
pub fn compute_merkle_root(transactions: &[Transaction]) -> Bytes32 {
    if transactions.is_empty() {
        return Bytes32::ZERO;
    }

    let mut level: Vec<Bytes32> = transactions.iter().map(Transaction::hash).collect();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or(left);
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(left.as_bytes());
                buf[32..].copy_from_slice(right.as_bytes());
                double_sha256(&buf)
            })
            .collect();
    }
    level[0]
}
