//! Gradient synchronization strategies.
//!
//! A [`SyncStrategy`] is the contract every collective scope satisfies:
//! leaf implementations bind it to a concrete transport over one set of
//! peers (the workers of one node, or the leaders of all nodes), and
//! [`HierarchicalStrategy`] composes one of each into a cluster-wide
//! collective.

mod hierarchical;

pub use hierarchical::HierarchicalStrategy;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

/// Named gradient tensors exchanged by one training step.
pub type GradientMap = HashMap<String, Vec<f32>>;

/// Contract for one collective-communication scope.
///
/// Every operation is a blocking collective: the caller does not
/// proceed until every participating peer has reached the same point.
/// One instance is owned exclusively by its composing strategy and
/// supports one in-flight collective at a time.
#[async_trait]
pub trait SyncStrategy: Send {
    /// Establish membership in this scope. `rank` and `size` are the
    /// worker's global rank and the cluster size; peer discovery goes
    /// through the coordinator.
    async fn init(&mut self, rank: i32, size: i32, coordinator_addr: &str) -> Result<()>;

    /// Reduce every named tensor across this scope, leaving each
    /// participant holding the reduced values.
    async fn all_reduce_gradients(&mut self, gradients: &mut GradientMap) -> Result<()>;

    /// Block until every member of this scope has arrived.
    async fn barrier(&mut self) -> Result<()>;

    /// Replace `tensor` with the root's copy, scope-wide.
    async fn broadcast_tensor(&mut self, tensor: &mut [f32], root_rank: i32) -> Result<()>;

    /// Global rank this scope reports for the calling worker.
    fn rank(&self) -> i32;

    /// Number of participants in this scope.
    fn size(&self) -> i32;

    /// Release transport resources held by this scope.
    async fn shutdown(&mut self) -> Result<()>;
}
