use chain::ChainParams;
use containers::{Bytes32, Height, InvVect, PeerStatus};
use libp2p_identity::PeerId;
use pretty_assertions::assert_eq;

use super::{child_of, test_config};
use crate::sync::{SyncError, SyncEvent, SyncParams, SyncService};
use crate::types::{OutboundSyncRequest, PeerInfo};

fn peer_info(height: u64) -> PeerInfo {
    PeerInfo::new(PeerId::random(), PeerStatus::full_node(Height(height)))
}

#[tokio::test]
async fn test_sync_service_creation() {
    let config = test_config(ChainParams::regtest(), SyncParams::default());
    let (service, handle) = SyncService::new(config.config);

    assert_eq!(service.manager().sync_peer_id(), None);
    assert!(!handle.is_closed());
}

#[tokio::test]
async fn test_events_applied_through_handle() {
    let mut config = test_config(ChainParams::regtest(), SyncParams::default());
    let (handle, _task) = SyncService::spawn(config.config);

    let info = peer_info(10);
    let peer_id = info.peer_id;
    handle.peer_connected(info).await.unwrap();

    assert_eq!(handle.sync_peer_id().await.unwrap(), Some(peer_id));
    assert!(!handle.is_current().await.unwrap());
    let request = config.requests.recv().await.unwrap();
    assert!(matches!(request, OutboundSyncRequest::GetHeaders { peer_id: p, .. } if p == peer_id));

    let stranger = PeerId::random();
    assert_eq!(
        handle.peer_disconnected(stranger).await,
        Err(SyncError::UnknownPeer(stranger))
    );
}

#[tokio::test]
async fn test_posted_events_apply_in_order() {
    let config = test_config(ChainParams::regtest(), SyncParams::default());
    let (handle, _task) = SyncService::spawn(config.config);

    let first = peer_info(5);
    let second = peer_info(9);
    let second_id = second.peer_id;
    handle.post(SyncEvent::PeerConnected(first)).unwrap();
    handle.post(SyncEvent::PeerConnected(second)).unwrap();

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.peers, 2);
    assert_eq!(stats.candidates, 2);
    assert_eq!(stats.sync_peer, Some(second_id));
}

#[tokio::test]
async fn test_concurrent_producers_never_fan_out() {
    let config = test_config(ChainParams::regtest(), SyncParams::default());
    let (handle, _task) = SyncService::spawn(config.config);
    let txs: Vec<Bytes32> = (1..=4).map(Bytes32::repeat_byte).collect();

    let producers: Vec<_> = (0..8)
        .map(|_| {
            let handle = handle.clone();
            let inventory: Vec<InvVect> = txs.iter().copied().map(InvVect::tx).collect();
            tokio::spawn(async move {
                let info = peer_info(0);
                let peer_id = info.peer_id;
                handle.peer_connected(info).await?;
                handle.inventory_received(peer_id, inventory).await
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap().unwrap();
    }

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.peers, 8);
    assert_eq!(stats.txs_in_flight, txs.len());
    assert_eq!(stats.queued_txs, 0);
}

#[tokio::test]
async fn test_process_block_via_handle() {
    let config = test_config(ChainParams::regtest(), SyncParams::default());
    let genesis = ChainParams::regtest().genesis_block();
    let (handle, _task) = SyncService::spawn(config.config);

    let parent = child_of(&genesis, 1);
    let orphan = child_of(&parent, 2);
    assert_eq!(handle.process_block(orphan).await, Ok(true));
    assert_eq!(handle.process_block(parent).await, Ok(false));

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.orphan_blocks, 0);
    assert_eq!(stats.chain_tip.height, Height(2));
    handle.tick().await.unwrap();
}

#[tokio::test]
async fn test_stopped_service_reports_manager_stopped() {
    let config = test_config(ChainParams::regtest(), SyncParams::default());
    let (service, handle) = SyncService::new(config.config);
    drop(service);

    assert!(handle.is_closed());
    assert_eq!(handle.peer_connected(peer_info(1)).await, Err(SyncError::ManagerStopped));
    assert_eq!(handle.stats().await, Err(SyncError::ManagerStopped));
    assert_eq!(handle.post(SyncEvent::Tick), Err(SyncError::ManagerStopped));
}

#[tokio::test]
async fn test_service_exits_when_handles_drop() {
    let config = test_config(ChainParams::regtest(), SyncParams::default());
    let (handle, task) = SyncService::spawn(config.config);
    handle.tick().await.unwrap();

    drop(handle);
    task.await.unwrap();
}
