use chain::ChainParams;
use containers::{Block, BlockHash, BlockHeader, ChainTip, Height};
use std::collections::HashMap;

/// Entry in the block index. Headers are indexed before their block data
/// arrives; `has_data` flips once the full block has been accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub header: BlockHeader,
    pub height: Height,
    pub has_data: bool,
}

/// In-memory block tree tracking every known header, the accepted blocks and
/// the current main chain.
///
/// The main chain is the longest branch of fully accepted blocks; the first
/// branch seen wins a tie.
#[derive(Debug, Clone)]
pub struct Store {
    pub params: ChainParams,

    /// Tip of the main chain.
    pub head: ChainTip,

    /// Highest header known, with or without block data.
    pub best_header: ChainTip,

    pub index: HashMap<BlockHash, BlockIndexEntry>,

    pub blocks: HashMap<BlockHash, Block>,

    /// `main_chain[h]` is the hash of the main-chain block at height `h`.
    pub main_chain: Vec<BlockHash>,
}

/// Initialize the store with the network's genesis block as the only block.
pub fn get_forkchoice_store(params: ChainParams) -> Store {
    let genesis = params.genesis_block();
    let genesis_hash = genesis.hash();
    let tip = ChainTip::new(genesis_hash, Height::GENESIS);

    Store {
        params,
        head: tip,
        best_header: tip,
        index: [(
            genesis_hash,
            BlockIndexEntry {
                header: genesis.header.clone(),
                height: Height::GENESIS,
                has_data: true,
            },
        )]
        .into(),
        blocks: [(genesis_hash, genesis)].into(),
        main_chain: vec![genesis_hash],
    }
}

impl Store {
    pub fn header_height(&self, hash: &BlockHash) -> Option<Height> {
        self.index.get(hash).map(|entry| entry.height)
    }

    pub fn has_block(&self, hash: &BlockHash) -> bool {
        self.index.get(hash).is_some_and(|entry| entry.has_data)
    }

    pub fn get_block(&self, hash: &BlockHash) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn main_chain_hash(&self, height: Height) -> Option<BlockHash> {
        self.main_chain.get(height.0 as usize).copied()
    }

    pub fn is_main_chain(&self, hash: &BlockHash) -> bool {
        self.header_height(hash)
            .and_then(|height| self.main_chain_hash(height))
            .is_some_and(|main| main == *hash)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
