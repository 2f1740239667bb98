//! Distributed-training coordination core.
//!
//! This crate provides the pieces a worker needs to take part in a
//! synchronized training job:
//!
//! - Error taxonomy and configuration shared across the workspace
//! - The `SyncStrategy` capability and the hierarchical composition
//!   of a within-node scope and a cross-node scope
//! - Network and server management for the collective transport
//! - The gRPC client for the membership registry

pub mod client;
pub mod config;
pub mod error;
pub mod strategy;
pub mod transport;

// Include generated protobuf code
pub mod proto {
    tonic::include_proto!("gsync.registry");
}

// Re-export commonly used types for convenience
pub use client::{HeartbeatTask, RegistryClient};
pub use config::WorkerConfig;
pub use error::{Result, SyncError};
pub use strategy::{GradientMap, HierarchicalStrategy, SyncStrategy};
pub use transport::{close_connections, connect_to_peers, PeerConnections, ServerManager};
