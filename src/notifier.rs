use std::sync::atomic::{AtomicU64, Ordering};

use containers::{BlockHash, Height, InvVect, Transaction, TxDesc};
use libp2p_identity::PeerId;
use networking::types::{PeerNotifier, RelayData};
use tracing::{debug, info};

/// Counts of notifications raised by the sync manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifierCounts {
    pub announced_txs: u64,
    pub height_updates: u64,
    pub relayed: u64,
    pub confirmed_txs: u64,
}

/// Peer notifier for a node without a connection manager: every
/// notification is logged and counted.
#[derive(Default)]
pub struct LoggingNotifier {
    announced_txs: AtomicU64,
    height_updates: AtomicU64,
    relayed: AtomicU64,
    confirmed_txs: AtomicU64,
}

impl LoggingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> NotifierCounts {
        NotifierCounts {
            announced_txs: self.announced_txs.load(Ordering::Relaxed),
            height_updates: self.height_updates.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            confirmed_txs: self.confirmed_txs.load(Ordering::Relaxed),
        }
    }
}

impl PeerNotifier for LoggingNotifier {
    fn announce_new_transactions(&self, txs: &[TxDesc], source: Option<PeerId>) {
        self.announced_txs.fetch_add(txs.len() as u64, Ordering::Relaxed);
        debug!(count = txs.len(), source = ?source, "Announcing new transactions");
    }

    fn update_peer_heights(&self, hash: &BlockHash, height: Height, source: Option<PeerId>) {
        self.height_updates.fetch_add(1, Ordering::Relaxed);
        debug!(hash = %hash.short(), height = height.0, source = ?source, "Updating peer heights");
    }

    fn relay_inventory(&self, inv: InvVect, data: RelayData) {
        self.relayed.fetch_add(1, Ordering::Relaxed);
        let RelayData::Header(header) = data;
        info!(inv = ?inv, timestamp = header.timestamp, "Relaying block inventory");
    }

    fn transaction_confirmed(&self, tx: &Transaction) {
        self.confirmed_txs.fetch_add(1, Ordering::Relaxed);
        debug!(tx = %tx.hash().short(), "Transaction confirmed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use containers::{BlockHeader, Bytes32};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_notifications_are_counted() {
        let notifier = LoggingNotifier::new();
        let hash = Bytes32::repeat_byte(1);

        notifier.update_peer_heights(&hash, Height(3), None);
        notifier.relay_inventory(InvVect::block(hash), RelayData::Header(BlockHeader::default()));
        notifier.transaction_confirmed(&Transaction::default());

        assert_eq!(
            notifier.counts(),
            NotifierCounts {
                announced_txs: 0,
                height_updates: 1,
                relayed: 1,
                confirmed_txs: 1,
            }
        );
    }
}
