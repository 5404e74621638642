//! Block-exchange peer node: TCP server for metadata and block requests, neighbor polling client,
//! on-disk block staging and reassembly. The `blockshare` binary is a thin CLI over this crate.

pub mod client;
pub mod config;
pub mod logging;
pub mod node;
pub mod server;
pub mod storage;
pub mod transport;

pub use config::{Config, ConfigError, Neighbor};
pub use node::{BoundNode, Node, NodeError, SharedCore};
