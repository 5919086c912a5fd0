use crate::store::Store;
use containers::{BlockHash, Height};

/// Number of most recent hashes included one by one before the locator
/// starts skipping back exponentially.
pub const LOCATOR_DENSE_PREFIX: usize = 10;

/// Walk back from `hash` to its ancestor at `height`.
pub fn get_ancestor(store: &Store, hash: &BlockHash, height: Height) -> Option<BlockHash> {
    let mut current = *hash;
    let mut entry = store.index.get(&current)?;
    if entry.height < height {
        return None;
    }

    while entry.height > height {
        current = entry.header.prev_block;
        entry = store.index.get(&current)?;
    }
    Some(current)
}

/// Highest main-chain block that `hash` descends from (possibly `hash` itself).
pub fn find_fork_point(store: &Store, hash: &BlockHash) -> Option<BlockHash> {
    let mut current = *hash;
    loop {
        if store.is_main_chain(&current) {
            return Some(current);
        }
        current = store.index.get(&current)?.header.prev_block;
    }
}

/// Block locator starting at `from`: the first hashes step back one block at a
/// time, then the step doubles, and genesis always closes the list.
pub fn block_locator(store: &Store, from: &BlockHash) -> Vec<BlockHash> {
    let Some(start) = store.index.get(from) else {
        return vec![store.main_chain[0]];
    };

    let mut locator = Vec::new();
    let mut height = start.height.0;
    let mut step = 1u64;
    let mut current = *from;

    loop {
        locator.push(current);
        if height == 0 {
            break;
        }
        if locator.len() >= LOCATOR_DENSE_PREFIX {
            step *= 2;
        }
        height = height.saturating_sub(step);
        match get_ancestor(store, &current, Height(height)) {
            Some(ancestor) => current = ancestor,
            None => break,
        }
    }

    let genesis = store.main_chain[0];
    if locator.last() != Some(&genesis) {
        locator.push(genesis);
    }
    locator
}

/// Hashes of the main-chain blocks after the most recent locator entry we
/// know, up to `stop` (inclusive) or `max` entries.
pub fn locate_main_chain(
    store: &Store,
    locator: &[BlockHash],
    stop: &BlockHash,
    max: usize,
) -> Vec<BlockHash> {
    let start = locator
        .iter()
        .find(|hash| store.is_main_chain(hash))
        .and_then(|hash| store.header_height(hash))
        .unwrap_or(Height::GENESIS);

    let mut hashes = Vec::new();
    for hash in store.main_chain.iter().skip(start.0 as usize + 1).take(max) {
        hashes.push(*hash);
        if hash == stop {
            break;
        }
    }
    hashes
}
