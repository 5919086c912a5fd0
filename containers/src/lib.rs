pub mod block;
pub mod checkpoint;
pub mod height;
pub mod inventory;
pub mod status;
pub mod tip;
pub mod transaction;
pub mod types;

pub use block::{Block, BlockHeader};
pub use checkpoint::Checkpoint;
pub use height::Height;
pub use inventory::{InvType, InvVect};
pub use status::{PeerStatus, ServiceFlags};
pub use tip::{ChainTip, ReorgInfo};
pub use transaction::{OutPoint, Transaction, TxDesc, TxIn, TxOut};
pub use types::{BlockHash, Bytes32, TxHash};
