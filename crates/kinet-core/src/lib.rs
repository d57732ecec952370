//! Kinet Core - Shared types and placement geometry
//!
//! This crate defines the data model and the pure decision library used by
//! the scenario controllers in `kinet-orchestrator`:
//! - Vehicle, access point and flow types
//! - TopologyIndex (static AP to node mapping, loaded once per run)
//! - Geometry and retention estimation (range tests, handoff prediction,
//!   inter-node latency proxy)

pub mod error;
pub mod topology;
pub mod types;

pub use error::*;
pub use topology::*;
pub use types::*;
