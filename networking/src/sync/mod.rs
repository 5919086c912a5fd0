/// Block and transaction synchronization.
///
/// Decides, under concurrent and possibly adversarial peer input, what to
/// request next, from whom and in what order, and how to react to headers,
/// blocks, transactions and peer churn while keeping one consistent view of
/// the best known chain. It includes:
///
/// - **Peer Manager**: Per-peer records (height, role, outstanding requests, stall score)
/// - **Orphan Pool**: Blocks whose parent is not yet known, bounded and age-evicted
/// - **Request Scheduler**: Next block/transaction requests under per-peer and global caps
/// - **Sync Manager**: Owns all of the above and applies peer events
/// - **Sync Service**: Single-writer event loop draining a multi-producer mailbox
///
/// ## Flow
///
/// 1. A peer completes its handshake; the highest qualifying peer becomes sync peer
/// 2. Headers are downloaded from the sync peer (headers-first), gated by checkpoints
/// 3. Block bodies are requested from any capable peer in ascending height order
/// 4. Blocks with unknown parents wait in the orphan pool until promoted
/// 5. A short header batch ends headers-first; new blocks then arrive by inventory
/// 6. Each tick detects stalled peers and reassigns their requests
///
/// ## Peer State Machine
///
/// - **Connected**: Handshake done, not a sync source
/// - **Candidate**: Qualifies as sync source
/// - **Active**: The sync peer
/// - **Passive**: Qualified, not selected
/// - **Stalled**: Requests overdue; no new work until it delivers again
pub mod config;
pub mod error;
pub mod manager;
pub mod orphan_pool;
pub mod peer_manager;
pub mod scheduler;
pub mod service;
pub mod states;

pub use config::*;
pub use error::SyncError;
pub use manager::{SyncManager, SyncStats};
pub use orphan_pool::{OrphanBlock, OrphanPool};
pub use peer_manager::{PeerManager, PeerState};
pub use scheduler::RequestScheduler;
pub use service::{SyncEvent, SyncHandle, SyncMessage, SyncService};
pub use states::{PeerSyncStatus, SyncState};

#[cfg(test)]
mod tests;
