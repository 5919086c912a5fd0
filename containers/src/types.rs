use alloy_primitives::B256;
use hex::FromHex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bytes32(pub B256);

/// Identifies a block by the double-SHA256 of its header.
pub type BlockHash = Bytes32;

/// Identifies a transaction by the double-SHA256 of its serialization.
pub type TxHash = Bytes32;

impl Bytes32 {
    pub const ZERO: Bytes32 = Bytes32(B256::ZERO);

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Hash filled with a single repeated byte. Handy for fixtures.
    pub fn repeat_byte(byte: u8) -> Self {
        Bytes32(B256::repeat_byte(byte))
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.as_bytes()[..4])
    }
}

impl From<[u8; 32]> for Bytes32 {
    fn from(bytes: [u8; 32]) -> Self {
        Bytes32(B256::from(bytes))
    }
}

/// Double SHA256, the digest used for block and transaction identifiers.
pub fn double_sha256(data: &[u8]) -> Bytes32 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    Bytes32::from(out)
}

impl FromStr for Bytes32 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes: [u8; 32] = <[u8; 32]>::from_hex(s)?;
        Ok(Bytes32::from(bytes))
    }
}

impl fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}
