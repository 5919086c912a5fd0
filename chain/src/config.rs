use std::path::Path;

use anyhow::{Context, Result, bail};
use containers::{Block, BlockHash, BlockHeader, Checkpoint, Height};
use serde::{Deserialize, Serialize};

pub const MAINNET_MAGIC: u32 = 0xd9b4_bef9;
pub const TESTNET_MAGIC: u32 = 0x0709_110b;
pub const REGTEST_MAGIC: u32 = 0xdab5_bffa;

pub const MAINNET_PORT: u16 = 9888;
pub const TESTNET_PORT: u16 = 19888;
pub const REGTEST_PORT: u16 = 29888;

pub const GENESIS_TIMESTAMP: u32 = 1_524_045_652;
pub const GENESIS_BITS: u32 = 0x1f07_ffff;
pub const REGTEST_GENESIS_BITS: u32 = 0x207f_ffff;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl std::str::FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => bail!("unknown network {other:?}"),
        }
    }
}

/// Parameters of the network a node participates in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainParams {
    pub network: Network,
    pub net_magic: u32,
    pub default_port: u16,
    pub genesis_header: BlockHeader,
    /// Sorted by ascending height.
    pub checkpoints: Vec<Checkpoint>,
}

#[derive(Debug, Deserialize)]
struct CheckpointFile {
    checkpoints: Vec<Checkpoint>,
}

impl ChainParams {
    pub fn mainnet() -> Self {
        Self::with_genesis(Network::Mainnet, MAINNET_MAGIC, MAINNET_PORT, GENESIS_BITS)
    }

    pub fn testnet() -> Self {
        Self::with_genesis(Network::Testnet, TESTNET_MAGIC, TESTNET_PORT, GENESIS_BITS)
    }

    pub fn regtest() -> Self {
        Self::with_genesis(Network::Regtest, REGTEST_MAGIC, REGTEST_PORT, REGTEST_GENESIS_BITS)
    }

    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Testnet => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    fn with_genesis(network: Network, net_magic: u32, default_port: u16, bits: u32) -> Self {
        Self {
            network,
            net_magic,
            default_port,
            genesis_header: BlockHeader {
                version: 1,
                timestamp: GENESIS_TIMESTAMP,
                bits,
                ..Default::default()
            },
            checkpoints: Vec::new(),
        }
    }

    pub fn genesis_block(&self) -> Block {
        Block::new(self.genesis_header.clone(), Vec::new())
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis_block().hash()
    }

    /// Replace the checkpoint list, keeping it sorted by height.
    pub fn with_checkpoints(mut self, mut checkpoints: Vec<Checkpoint>) -> Self {
        checkpoints.sort_by_key(|checkpoint| checkpoint.height);
        checkpoints.dedup_by_key(|checkpoint| checkpoint.height);
        self.checkpoints = checkpoints;
        self
    }

    /// Load checkpoints from a YAML file of the form
    /// `checkpoints: [{ height: 1000, hash: "0x..." }, ...]`.
    pub fn load_checkpoints(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open checkpoint file {path:?}"))?;
        let parsed: CheckpointFile = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse checkpoint file {path:?}"))?;
        Ok(self.with_checkpoints(parsed.checkpoints))
    }

    /// First checkpoint strictly above `height`.
    pub fn next_checkpoint(&self, height: Height) -> Option<Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height > height)
            .copied()
    }

    pub fn latest_checkpoint(&self) -> Option<Checkpoint> {
        self.checkpoints.last().copied()
    }

    pub fn checkpoint_at(&self, height: Height) -> Option<Checkpoint> {
        self.checkpoints
            .binary_search_by_key(&height, |checkpoint| checkpoint.height)
            .ok()
            .map(|index| self.checkpoints[index])
    }

    pub fn is_regtest(&self) -> bool {
        self.network == Network::Regtest
    }
}
