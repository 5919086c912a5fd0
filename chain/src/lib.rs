pub mod config;

pub use config::{ChainParams, Network};
