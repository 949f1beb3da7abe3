//! Deterministic simulation harness for the consensus core.
//!
//! Provides a seeded in-memory network (latency, jitter, loss, partitions)
//! and a synchronous multi-node runner. No real time and no real I/O are
//! involved: the same seed and script always reproduce the same run, which
//! the end-to-end and determinism tests rely on.

/// Index type for simulation-only node routing.
pub type NodeIndex = u32;

mod network;
mod runner;

pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{SimulationRunner, TrafficRecord};
