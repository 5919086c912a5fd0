use crate::helpers::find_fork_point;
use crate::store::*;
use containers::{Block, BlockHash, BlockHeader, ChainTip, ReorgInfo};
use tracing::{debug, info};

/// Result of accepting a block into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOutcome {
    /// The accepted block.
    pub block: ChainTip,
    /// Whether the block became the main-chain tip.
    pub is_new_tip: bool,
    /// Present when becoming the tip required switching branches.
    pub reorg: Option<ReorgInfo>,
}

#[inline]
pub fn on_headers(store: &mut Store, headers: &[BlockHeader]) -> Result<(), String> {
    for header in headers {
        let hash = header.hash();
        if store.index.contains_key(&hash) {
            continue;
        }

        let parent_height = store.header_height(&header.prev_block).ok_or_else(|| {
            format!(
                "Err: (Fork-choice::Handlers::OnHeaders) Header {} does not connect to a known header",
                hash.short()
            )
        })?;
        let height = parent_height.next();

        if let Some(checkpoint) = store.params.checkpoint_at(height) {
            if checkpoint.hash != hash {
                return Err(format!(
                    "Err: (Fork-choice::Handlers::OnHeaders) Header {} at height {} conflicts with checkpoint {}",
                    hash.short(),
                    height,
                    checkpoint.hash.short()
                ));
            }
        }

        store.index.insert(
            hash,
            BlockIndexEntry {
                header: header.clone(),
                height,
                has_data: false,
            },
        );
        if height > store.best_header.height {
            store.best_header = ChainTip::new(hash, height);
        }
    }
    Ok(())
}

pub fn on_block(store: &mut Store, block: Block) -> Result<BlockOutcome, String> {
    let hash = block.hash();

    if store.has_block(&hash) {
        return Err(format!(
            "Err: (Fork-choice::Handlers::OnBlock) Already have block {}",
            hash.short()
        ));
    }

    let parent_hash = block.parent_hash();
    let parent_height = match store.index.get(&parent_hash) {
        Some(parent) if parent.has_data => parent.height,
        _ => {
            return Err(format!(
                "Err: (Fork-choice::Handlers::OnBlock) Parent {} of block {} not yet available",
                parent_hash.short(),
                hash.short()
            ));
        }
    };

    if !block.has_valid_merkle_root() {
        return Err(format!(
            "Err: (Fork-choice::Handlers::OnBlock) Block {} merkle root does not commit to its transactions",
            hash.short()
        ));
    }

    let height = parent_height.next();
    if let Some(checkpoint) = store.params.checkpoint_at(height) {
        if checkpoint.hash != hash {
            return Err(format!(
                "Err: (Fork-choice::Handlers::OnBlock) Block {} at height {} conflicts with checkpoint",
                hash.short(),
                height
            ));
        }
    }

    store.index.insert(
        hash,
        BlockIndexEntry {
            header: block.header.clone(),
            height,
            has_data: true,
        },
    );
    store.blocks.insert(hash, block);

    let tip = ChainTip::new(hash, height);
    if height > store.best_header.height {
        store.best_header = tip;
    }

    if height <= store.head.height {
        debug!(hash = %hash.short(), height = height.0, "Accepted side-chain block");
        return Ok(BlockOutcome {
            block: tip,
            is_new_tip: false,
            reorg: None,
        });
    }

    if parent_hash == store.head.hash {
        store.main_chain.push(hash);
        store.head = tip;
        return Ok(BlockOutcome {
            block: tip,
            is_new_tip: true,
            reorg: None,
        });
    }

    let reorg = switch_branch(store, hash)?;
    info!(
        new_tip = %tip,
        depth = reorg.depth(),
        "Reorganized main chain"
    );
    store.head = tip;

    Ok(BlockOutcome {
        block: tip,
        is_new_tip: true,
        reorg: Some(reorg),
    })
}

fn switch_branch(store: &mut Store, new_tip: BlockHash) -> Result<ReorgInfo, String> {
    let fork = find_fork_point(store, &new_tip).ok_or_else(|| {
        "Err: (Fork-choice::Handlers::SwitchBranch) Branch does not join the main chain".to_string()
    })?;
    let fork_height = store.header_height(&fork).unwrap_or_default();

    let disconnected = store.main_chain[fork_height.0 as usize + 1..]
        .iter()
        .rev()
        .filter_map(|hash| store.blocks.get(hash).cloned())
        .collect();

    let mut branch = Vec::new();
    let mut current = new_tip;
    while current != fork {
        branch.push(current);
        current = match store.index.get(&current) {
            Some(entry) => entry.header.prev_block,
            None => break,
        };
    }
    branch.reverse();

    let connected = branch
        .iter()
        .filter_map(|hash| store.blocks.get(hash).cloned())
        .collect();

    store.main_chain.truncate(fork_height.0 as usize + 1);
    store.main_chain.extend(branch);

    Ok(ReorgInfo {
        disconnected,
        connected,
    })
}
