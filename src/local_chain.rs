/// Chain validator over the in-memory block index.
///
/// Header and block acceptance are delegated to the fork-choice handlers.
use chain::ChainParams;
use containers::{Block, BlockHash, BlockHeader, ChainTip, Height};
use fork_choice::Store;
use networking::types::{BlockAcceptance, ChainValidator};
use parking_lot::Mutex;
use tracing::debug;

pub struct LocalChain {
    store: Mutex<Store>,
}

impl LocalChain {
    pub fn new(params: ChainParams) -> Self {
        Self {
            store: Mutex::new(fork_choice::get_forkchoice_store(params)),
        }
    }

    /// Number of fully accepted blocks, genesis included.
    pub fn block_count(&self) -> usize {
        self.store.lock().len()
    }
}

impl ChainValidator for LocalChain {
    fn submit_block(&self, block: &Block) -> Result<BlockAcceptance, String> {
        let mut store = self.store.lock();
        let outcome = fork_choice::on_block(&mut store, block.clone())?;
        debug!(tip = %store.head, accepted = %outcome.block, "Block stored");

        Ok(BlockAcceptance {
            block: outcome.block,
            is_new_tip: outcome.is_new_tip,
            reorg: outcome.reorg,
        })
    }

    fn submit_headers(&self, headers: &[BlockHeader]) -> Result<(), String> {
        fork_choice::on_headers(&mut self.store.lock(), headers)
    }

    fn best_tip(&self) -> ChainTip {
        self.store.lock().head
    }

    fn have_block(&self, hash: &BlockHash) -> bool {
        self.store.lock().has_block(hash)
    }

    fn header_height(&self, hash: &BlockHash) -> Option<Height> {
        self.store.lock().header_height(hash)
    }

    fn block_locator(&self, from: Option<&BlockHash>) -> Vec<BlockHash> {
        let store = self.store.lock();
        let from = from.copied().unwrap_or(store.head.hash);
        fork_choice::block_locator(&store, &from)
    }
}
