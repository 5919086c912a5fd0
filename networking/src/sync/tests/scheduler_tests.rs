use std::time::Instant;

use containers::{BlockHash, Bytes32, Height, PeerStatus, ServiceFlags};
use libp2p_identity::PeerId;
use pretty_assertions::assert_eq;

use crate::sync::{PeerManager, PeerSyncStatus, RequestScheduler, SyncError, SyncParams};
use crate::types::OutboundSyncRequest;

fn hash(byte: u8) -> BlockHash {
    Bytes32::repeat_byte(byte)
}

fn add_peer(peers: &mut PeerManager, height: u64, now: Instant) -> PeerId {
    let peer_id = PeerId::random();
    peers.add_peer(peer_id, &PeerStatus::full_node(Height(height)), now);
    peer_id
}

#[test]
fn test_blocks_scheduled_ascending_without_gaps() {
    let now = Instant::now();
    let mut peers = PeerManager::new();
    let peer = add_peer(&mut peers, 2, now);
    let mut scheduler = RequestScheduler::new(&SyncParams::default());

    for height in [3u8, 1, 2] {
        assert!(scheduler.queue_block(Height(height as u64), hash(height)));
    }
    assert!(!scheduler.queue_block(Height(1), hash(1)));

    let requests = scheduler.schedule(&mut peers, now);
    assert_eq!(
        requests,
        vec![OutboundSyncRequest::GetBlocks {
            peer_id: peer,
            hashes: vec![hash(1), hash(2)],
        }]
    );
    // Nobody has height 3 yet.
    assert_eq!(scheduler.queued_heights(), vec![Height(3)]);
    assert_eq!(scheduler.blocks_in_flight(), 2);
}

#[test]
fn test_least_loaded_peer_wins() {
    let now = Instant::now();
    let mut peers = PeerManager::new();
    let first = add_peer(&mut peers, 10, now);
    let second = add_peer(&mut peers, 10, now);
    let mut scheduler = RequestScheduler::new(&SyncParams::default());
    for height in 1..=4u8 {
        scheduler.queue_block(Height(height as u64), hash(height));
    }

    let requests = scheduler.schedule(&mut peers, now);
    assert_eq!(
        requests,
        vec![
            OutboundSyncRequest::GetBlocks {
                peer_id: first,
                hashes: vec![hash(1), hash(3)],
            },
            OutboundSyncRequest::GetBlocks {
                peer_id: second,
                hashes: vec![hash(2), hash(4)],
            },
        ]
    );
}

#[test]
fn test_per_peer_and_global_caps() {
    let now = Instant::now();
    let mut peers = PeerManager::new();
    let first = add_peer(&mut peers, 100, now);
    let mut scheduler = RequestScheduler::new(&SyncParams {
        max_blocks_in_flight_per_peer: 2,
        max_blocks_in_flight: 3,
        ..SyncParams::default()
    });
    for height in 1..=6u8 {
        scheduler.queue_block(Height(height as u64), hash(height));
    }

    scheduler.schedule(&mut peers, now);
    assert_eq!(scheduler.blocks_in_flight(), 2);
    assert_eq!(peers.get_peer(&first).unwrap().requested_blocks.len(), 2);

    let second = add_peer(&mut peers, 100, now);
    let requests = scheduler.schedule(&mut peers, now);
    assert_eq!(
        requests,
        vec![OutboundSyncRequest::GetBlocks {
            peer_id: second,
            hashes: vec![hash(3)],
        }]
    );
    assert_eq!(scheduler.blocks_in_flight(), 3);
    assert_eq!(scheduler.queued_blocks(), 3);
}

#[test]
fn test_pruned_and_stalled_peers_get_no_blocks() {
    let now = Instant::now();
    let mut peers = PeerManager::new();
    let pruned = PeerId::random();
    peers.add_peer(pruned, &PeerStatus::new(Height(10), ServiceFlags::NONE), now);
    let stalled = add_peer(&mut peers, 10, now);
    peers.get_peer_mut(&stalled).unwrap().transition(PeerSyncStatus::Stalled);
    let mut scheduler = RequestScheduler::new(&SyncParams::default());
    scheduler.queue_block(Height(1), hash(1));

    assert!(scheduler.schedule(&mut peers, now).is_empty());
    assert_eq!(scheduler.queued_blocks(), 1);
}

#[test]
fn test_assign_twice_is_duplicate_request() {
    let now = Instant::now();
    let mut peers = PeerManager::new();
    let first = add_peer(&mut peers, 10, now);
    let second = add_peer(&mut peers, 10, now);
    let mut scheduler = RequestScheduler::new(&SyncParams::default());

    scheduler
        .assign_block(&mut peers, hash(1), Some(Height(1)), first, now)
        .unwrap();
    assert_eq!(
        scheduler.assign_block(&mut peers, hash(1), Some(Height(1)), second, now),
        Err(SyncError::DuplicateRequest {
            hash: hash(1),
            peer: first,
        })
    );
    assert!(peers.get_peer(&second).unwrap().requested_blocks.is_empty());

    let stranger = PeerId::random();
    assert_eq!(
        scheduler.assign_tx(&mut peers, hash(9), stranger, now),
        Err(SyncError::UnknownPeer(stranger))
    );
}

#[test]
fn test_released_block_goes_to_another_peer() {
    let now = Instant::now();
    let mut peers = PeerManager::new();
    let slow = add_peer(&mut peers, 10, now);
    let other = add_peer(&mut peers, 10, now);
    let mut scheduler = RequestScheduler::new(&SyncParams::default());
    scheduler.queue_block(Height(1), hash(1));
    scheduler.schedule(&mut peers, now);
    assert_eq!(scheduler.block_in_flight_from(&hash(1)), Some(slow));

    let peer = peers.get_peer_mut(&slow).unwrap();
    peer.transition(PeerSyncStatus::Stalled);
    peer.requested_blocks.remove(&hash(1));
    assert!(!scheduler.release_block(&hash(1), &other));
    assert!(scheduler.release_block(&hash(1), &slow));

    let requests = scheduler.schedule(&mut peers, now);
    assert_eq!(
        requests,
        vec![OutboundSyncRequest::GetBlocks {
            peer_id: other,
            hashes: vec![hash(1)],
        }]
    );
}

#[test]
fn test_not_found_peer_is_skipped() {
    let now = Instant::now();
    let mut peers = PeerManager::new();
    let first = add_peer(&mut peers, 10, now);
    let second = add_peer(&mut peers, 10, now);
    let mut scheduler = RequestScheduler::new(&SyncParams::default());
    scheduler.queue_block(Height(1), hash(1));
    scheduler.schedule(&mut peers, now);

    peers.get_peer_mut(&first).unwrap().requested_blocks.remove(&hash(1));
    scheduler.mark_not_found(hash(1), first);
    scheduler.release_block(&hash(1), &first);
    scheduler.schedule(&mut peers, now);

    assert_eq!(scheduler.block_in_flight_from(&hash(1)), Some(second));
}

#[test]
fn test_transactions_first_announcer_served_first() {
    let now = Instant::now();
    let mut peers = PeerManager::new();
    let early = add_peer(&mut peers, 0, now);
    let late = add_peer(&mut peers, 0, now);
    let mut scheduler = RequestScheduler::new(&SyncParams::default());

    assert!(scheduler.announce_tx(hash(1), late));
    assert!(!scheduler.announce_tx(hash(1), early));
    assert!(scheduler.announce_tx(hash(2), early));

    let requests = scheduler.schedule(&mut peers, now);
    assert_eq!(
        requests,
        vec![
            OutboundSyncRequest::GetTransactions {
                peer_id: late,
                hashes: vec![hash(1)],
            },
            OutboundSyncRequest::GetTransactions {
                peer_id: early,
                hashes: vec![hash(2)],
            },
        ]
    );
    assert_eq!(scheduler.tx_in_flight_from(&hash(1)), Some(late));
    assert_eq!(scheduler.complete_tx(&hash(1)), Some(late));
    assert!(!scheduler.is_tx_pending(&hash(1)));
}

#[test]
fn test_announced_block_only_from_sources() {
    let now = Instant::now();
    let mut peers = PeerManager::new();
    let _silent = add_peer(&mut peers, 50, now);
    let announcer = add_peer(&mut peers, 0, now);
    let mut scheduler = RequestScheduler::new(&SyncParams::default());

    assert!(scheduler.announce_block(hash(7), announcer));
    let requests = scheduler.schedule(&mut peers, now);
    assert_eq!(
        requests,
        vec![OutboundSyncRequest::GetBlocks {
            peer_id: announcer,
            hashes: vec![hash(7)],
        }]
    );

    // Sole source gone: nothing to requeue.
    peers.get_peer_mut(&announcer).unwrap().requested_blocks.clear();
    assert!(scheduler.release_block(&hash(7), &announcer));
    assert!(!scheduler.is_block_pending(&hash(7)));
}

#[test]
fn test_forget_peer_abandons_its_announcements() {
    let now = Instant::now();
    let mut peers = PeerManager::new();
    let peer = add_peer(&mut peers, 0, now);
    let mut scheduler = RequestScheduler::new(&SyncParams::default());
    scheduler.announce_block(hash(1), peer);
    scheduler.announce_tx(hash(2), peer);
    assert_eq!(scheduler.queued_blocks(), 1);
    assert_eq!(scheduler.queued_txs(), 1);

    scheduler.forget_peer(&peer);
    assert_eq!(scheduler.queued_blocks(), 0);
    assert_eq!(scheduler.queued_txs(), 0);
}

#[test]
fn test_header_chain_supersedes_announcement() {
    let now = Instant::now();
    let mut peers = PeerManager::new();
    let peer = add_peer(&mut peers, 5, now);
    let mut scheduler = RequestScheduler::new(&SyncParams::default());

    scheduler.announce_block(hash(4), peer);
    assert!(scheduler.queue_block(Height(4), hash(4)));
    assert_eq!(scheduler.queued_blocks(), 1);

    scheduler.schedule(&mut peers, now);
    assert_eq!(scheduler.block_in_flight_from(&hash(4)), Some(peer));
    assert_eq!(scheduler.complete_block(&hash(4)), Some(peer));
    assert_eq!(scheduler.blocks_in_flight(), 0);
}
