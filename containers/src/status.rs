use crate::Height;
use serde::{Deserialize, Serialize};

/// Service bits a peer advertises in its version handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceFlags(pub u64);

impl ServiceFlags {
    pub const NONE: ServiceFlags = ServiceFlags(0);
    /// Peer serves the full block chain (not pruned).
    pub const NETWORK: ServiceFlags = ServiceFlags(1 << 0);
    pub const BLOOM: ServiceFlags = ServiceFlags(1 << 2);
    pub const WITNESS: ServiceFlags = ServiceFlags(1 << 3);
    pub const CF: ServiceFlags = ServiceFlags(1 << 6);

    pub fn has(&self, flags: ServiceFlags) -> bool {
        self.0 & flags.0 == flags.0
    }

    pub fn with(self, flags: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 | flags.0)
    }
}

/// Chain status a peer reported when its handshake completed.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeerStatus {
    pub protocol_version: u32,
    pub services: ServiceFlags,
    pub user_agent: String,
    /// Height of the peer's best block at handshake time.
    pub height: Height,
}

impl PeerStatus {
    pub fn new(height: Height, services: ServiceFlags) -> Self {
        Self {
            protocol_version: 0,
            services,
            user_agent: String::new(),
            height,
        }
    }

    /// A full node serving blocks at the given height.
    pub fn full_node(height: Height) -> Self {
        Self::new(height, ServiceFlags::NETWORK)
    }
}
