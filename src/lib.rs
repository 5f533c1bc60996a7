//! fcopy Library
//!
//! Multi-destination file replication. A client streams chunks of a
//! local file to the root of a chain or binary tree of nodes; each node
//! writes the chunk locally while forwarding it to its children, so
//! every byte crosses each propagation edge exactly once.

pub mod buffer;
pub mod client;
pub mod config;
pub mod file_manager;
pub mod limiter;
pub mod localaddr;
pub mod message;
pub mod protocol;
pub mod sender;
pub mod service;
pub mod target;
