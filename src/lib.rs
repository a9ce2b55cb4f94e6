//! `blockswarm`: a peer-assisted block file-distribution system.
//!
//! The teacher repo has no `lib.rs` (it builds a single binary); this
//! crate adds one purely so `src/main.rs` and `#[cfg(test)]` modules can
//! share one set of module declarations.

pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod hashing;
pub mod peer_table;
pub mod proto;
pub mod server;
pub mod token;
pub mod trusted_peer;
