use crate::types::double_sha256;
use crate::{Height, TxHash};
use serde::{Deserialize, Serialize};

/// Reference to an output of a previous transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: TxHash,
    pub index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub signature_script: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// A transaction as far as synchronization is concerned: enough structure to
/// identify it and to tell which outputs it spends. Script semantics belong to
/// the validation engine.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Canonical little-endian serialization used for hashing.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.inputs.len() * 48 + self.outputs.len() * 40);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            out.extend_from_slice(input.previous_output.txid.as_bytes());
            out.extend_from_slice(&input.previous_output.index.to_le_bytes());
            out.extend_from_slice(&(input.signature_script.len() as u32).to_le_bytes());
            out.extend_from_slice(&input.signature_script);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
        out.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            out.extend_from_slice(&output.value.to_le_bytes());
            out.extend_from_slice(&(output.script_pubkey.len() as u32).to_le_bytes());
            out.extend_from_slice(&output.script_pubkey);
        }
        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out
    }

    pub fn hash(&self) -> TxHash {
        double_sha256(&self.serialize())
    }

    /// Coinbase transactions spend a single null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].previous_output.txid.is_zero()
            && self.inputs[0].previous_output.index == u32::MAX
    }

    pub fn spends(&self) -> impl Iterator<Item = &OutPoint> {
        self.inputs.iter().map(|input| &input.previous_output)
    }
}

/// Descriptor returned by the transaction pool for an admitted transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDesc {
    pub tx: Transaction,
    /// Chain height when the transaction entered the pool.
    pub height: Height,
    pub fee: u64,
}

impl TxDesc {
    pub fn hash(&self) -> TxHash {
        self.tx.hash()
    }
}
