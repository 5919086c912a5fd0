//! Common test utilities for block index tests

use chain::ChainParams;
use containers::*;

pub fn test_params() -> ChainParams {
    ChainParams::regtest()
}

/// Coinbase-like transaction carrying a tag so sibling blocks hash differently
pub fn tagged_tx(tag: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            previous_output: OutPoint {
                txid: Bytes32::ZERO,
                index: u32::MAX,
            },
            signature_script: tag.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 50,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

pub fn child_of(parent: &Block, tag: u64) -> Block {
    Block::new(
        BlockHeader {
            version: 1,
            prev_block: parent.hash(),
            timestamp: parent.header.timestamp + 1,
            bits: parent.header.bits,
            nonce: tag as u32,
            ..Default::default()
        },
        vec![tagged_tx(tag)],
    )
}

/// Build `len` blocks on top of `parent`
pub fn extend(parent: &Block, len: usize, tag: u64) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(len);
    let mut tip = parent.clone();
    for i in 0..len {
        let block = child_of(&tip, tag * 10_000 + i as u64);
        tip = block.clone();
        blocks.push(block);
    }
    blocks
}
