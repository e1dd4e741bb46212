//! # raftnode
//!
//! `raftnode` runs a Raft node that replicates a key-value store. Nodes elect a leader,
//! replicate the leader's log to their peers and apply committed entries in order.
//! Members join and leave through two-phase (joint consensus) configuration changes.
//!
//! A node is started with [`start`], which wires it to any transport implementing
//! [`rpc::RPCBuilder`]. The default `http-rpc` feature provides a JSON-over-HTTP transport
//! and a redirect-following [`client::HttpClient`].

#[cfg(feature = "http-rpc")]
pub mod client;
pub mod command;
pub mod config;
pub mod configuration;
pub mod error;
pub mod protocol;
pub mod rpc;
pub mod state;
pub mod storage;

pub use config::Config;
pub use error::RaftError;
pub use protocol::{start, ProtocolState, Running};
