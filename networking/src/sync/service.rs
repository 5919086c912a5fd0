/// Sync service: the serialized event loop around `SyncManager`.
///
/// Peer I/O tasks hold a cloned `SyncHandle` and post events into one
/// unbounded mailbox. A single task drains the mailbox in arrival order and
/// applies each event to the manager, so peer records, orphan pool and sync
/// progress have exactly one writer. A periodic tick drives stall detection.
///
/// Events from one handle are applied in the order they were posted; there is
/// no ordering across handles. The loop ends once every handle is dropped.
use std::time::{Duration, Instant};

use containers::{Block, BlockHash, BlockHeader, Height, InvVect, Transaction};
use libp2p_identity::PeerId;
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, trace};

use super::{
    config::SyncConfig,
    error::SyncError,
    manager::{SyncManager, SyncStats},
};
use crate::types::PeerInfo;

/// Typed input produced by peer I/O handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    PeerConnected(PeerInfo),
    PeerDisconnected(PeerId),
    Headers {
        peer_id: PeerId,
        headers: Vec<BlockHeader>,
    },
    Block {
        peer_id: PeerId,
        block: Block,
    },
    Transaction {
        peer_id: PeerId,
        tx: Transaction,
    },
    Inventory {
        peer_id: PeerId,
        inventory: Vec<InvVect>,
    },
    NotFound {
        peer_id: PeerId,
        inventory: Vec<InvVect>,
    },
    PeerHeight {
        peer_id: PeerId,
        hash: BlockHash,
        height: Height,
    },
    Tick,
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::PeerConnected(_) => "peer_connected",
            SyncEvent::PeerDisconnected(_) => "peer_disconnected",
            SyncEvent::Headers { .. } => "headers",
            SyncEvent::Block { .. } => "block",
            SyncEvent::Transaction { .. } => "transaction",
            SyncEvent::Inventory { .. } => "inventory",
            SyncEvent::NotFound { .. } => "not_found",
            SyncEvent::PeerHeight { .. } => "peer_height",
            SyncEvent::Tick => "tick",
        }
    }

    /// Apply the event to the manager.
    pub fn apply(self, manager: &mut SyncManager, now: Instant) -> Result<(), SyncError> {
        match self {
            SyncEvent::PeerConnected(info) => manager.peer_connected(info, now),
            SyncEvent::PeerDisconnected(peer_id) => manager.peer_disconnected(&peer_id, now),
            SyncEvent::Headers { peer_id, headers } => manager.headers_received(&peer_id, headers, now),
            SyncEvent::Block { peer_id, block } => manager.block_received(&peer_id, block, now),
            SyncEvent::Transaction { peer_id, tx } => manager.transaction_received(&peer_id, tx, now),
            SyncEvent::Inventory { peer_id, inventory } => {
                manager.inventory_received(&peer_id, inventory, now)
            }
            SyncEvent::NotFound { peer_id, inventory } => manager.not_found(&peer_id, inventory, now),
            SyncEvent::PeerHeight {
                peer_id,
                hash,
                height,
            } => manager.peer_height_updated(&peer_id, hash, height, now),
            SyncEvent::Tick => {
                manager.tick(now);
                Ok(())
            }
        }
    }
}

type Ack<T> = oneshot::Sender<Result<T, SyncError>>;

/// Mailbox entries: events, optionally acknowledged, and queries.
#[derive(Debug)]
pub enum SyncMessage {
    Event {
        event: SyncEvent,
        ack: Option<Ack<()>>,
    },
    ProcessBlock {
        block: Block,
        ack: Ack<bool>,
    },
    SyncPeerId(oneshot::Sender<Option<PeerId>>),
    IsCurrent(oneshot::Sender<bool>),
    Stats(oneshot::Sender<SyncStats>),
}

pub struct SyncService {
    manager: SyncManager,
    mailbox: mpsc::UnboundedReceiver<SyncMessage>,
    tick_interval: Duration,
}

impl SyncService {
    pub fn new(config: SyncConfig) -> (Self, SyncHandle) {
        let (sender, mailbox) = mpsc::unbounded_channel();
        let tick_interval = config.params.tick_interval();
        let service = Self {
            manager: SyncManager::new(config),
            mailbox,
            tick_interval,
        };
        (service, SyncHandle { sender })
    }

    /// Create the service and run it on the current tokio runtime.
    pub fn spawn(config: SyncConfig) -> (SyncHandle, JoinHandle<()>) {
        let (service, handle) = Self::new(config);
        let task = tokio::spawn(service.start());
        (handle, task)
    }

    pub fn manager(&self) -> &SyncManager {
        &self.manager
    }

    pub async fn start(mut self) {
        let mut tick = interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_interval = ?self.tick_interval, "Sync service started");

        loop {
            select! {
                message = self.mailbox.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    self.handle_message(message);
                }
                _ = tick.tick() => {
                    self.manager.tick(Instant::now());
                }
            }
        }

        info!("Sync service stopped");
    }

    fn handle_message(&mut self, message: SyncMessage) {
        let now = Instant::now();
        match message {
            SyncMessage::Event { event, ack } => {
                let name = event.name();
                let result = event.apply(&mut self.manager, now);
                match &result {
                    Ok(()) => trace!(event = name, "Applied sync event"),
                    Err(err) => debug!(event = name, %err, "Sync event not applied"),
                }
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
            }
            SyncMessage::ProcessBlock { block, ack } => {
                let _ = ack.send(self.manager.process_block(block, now));
            }
            SyncMessage::SyncPeerId(reply) => {
                let _ = reply.send(self.manager.sync_peer_id());
            }
            SyncMessage::IsCurrent(reply) => {
                let _ = reply.send(self.manager.is_current());
            }
            SyncMessage::Stats(reply) => {
                let _ = reply.send(self.manager.stats());
            }
        }
    }
}

/// Cloneable producer side of the sync mailbox.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    sender: mpsc::UnboundedSender<SyncMessage>,
}

impl SyncHandle {
    /// Enqueue an event without waiting for it to be applied.
    pub fn post(&self, event: SyncEvent) -> Result<(), SyncError> {
        self.sender
            .send(SyncMessage::Event { event, ack: None })
            .map_err(|_| SyncError::ManagerStopped)
    }

    /// Enqueue an event and wait for the manager's verdict on it.
    pub async fn submit(&self, event: SyncEvent) -> Result<(), SyncError> {
        let (ack, response) = oneshot::channel();
        self.sender
            .send(SyncMessage::Event {
                event,
                ack: Some(ack),
            })
            .map_err(|_| SyncError::ManagerStopped)?;
        response.await.map_err(|_| SyncError::ManagerStopped)?
    }

    pub async fn peer_connected(&self, info: PeerInfo) -> Result<(), SyncError> {
        self.submit(SyncEvent::PeerConnected(info)).await
    }

    pub async fn peer_disconnected(&self, peer_id: PeerId) -> Result<(), SyncError> {
        self.submit(SyncEvent::PeerDisconnected(peer_id)).await
    }

    pub async fn headers_received(&self, peer_id: PeerId, headers: Vec<BlockHeader>) -> Result<(), SyncError> {
        self.submit(SyncEvent::Headers { peer_id, headers }).await
    }

    pub async fn block_received(&self, peer_id: PeerId, block: Block) -> Result<(), SyncError> {
        self.submit(SyncEvent::Block { peer_id, block }).await
    }

    pub async fn transaction_received(&self, peer_id: PeerId, tx: Transaction) -> Result<(), SyncError> {
        self.submit(SyncEvent::Transaction { peer_id, tx }).await
    }

    pub async fn inventory_received(&self, peer_id: PeerId, inventory: Vec<InvVect>) -> Result<(), SyncError> {
        self.submit(SyncEvent::Inventory { peer_id, inventory }).await
    }

    pub async fn not_found(&self, peer_id: PeerId, inventory: Vec<InvVect>) -> Result<(), SyncError> {
        self.submit(SyncEvent::NotFound { peer_id, inventory }).await
    }

    pub async fn peer_height_updated(&self, peer_id: PeerId, hash: BlockHash, height: Height) -> Result<(), SyncError> {
        self.submit(SyncEvent::PeerHeight {
            peer_id,
            hash,
            height,
        })
        .await
    }

    pub async fn tick(&self) -> Result<(), SyncError> {
        self.submit(SyncEvent::Tick).await
    }

    /// Returns whether the block was stored as an orphan.
    pub async fn process_block(&self, block: Block) -> Result<bool, SyncError> {
        let (ack, response) = oneshot::channel();
        self.sender
            .send(SyncMessage::ProcessBlock { block, ack })
            .map_err(|_| SyncError::ManagerStopped)?;
        response.await.map_err(|_| SyncError::ManagerStopped)?
    }

    pub async fn sync_peer_id(&self) -> Result<Option<PeerId>, SyncError> {
        self.query(SyncMessage::SyncPeerId).await
    }

    pub async fn is_current(&self) -> Result<bool, SyncError> {
        self.query(SyncMessage::IsCurrent).await
    }

    pub async fn stats(&self) -> Result<SyncStats, SyncError> {
        self.query(SyncMessage::Stats).await
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn query<T>(&self, message: impl FnOnce(oneshot::Sender<T>) -> SyncMessage) -> Result<T, SyncError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(message(reply))
            .map_err(|_| SyncError::ManagerStopped)?;
        response.await.map_err(|_| SyncError::ManagerStopped)
    }
}
