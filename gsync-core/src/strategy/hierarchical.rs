//! Two-level composition of collective scopes.
//!
//! Gradients are reduced within each node first, then once across node
//! leaders, then broadcast back within each node, so only one message
//! per node crosses node boundaries while every worker ends up holding
//! the value a flat cluster-wide all-reduce would have produced.

use async_trait::async_trait;
use tracing::{debug, info};

use super::{GradientMap, SyncStrategy};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StrategyState {
    Uninitialized,
    Initialized,
    Active,
    ShutDown,
}

/// Composes a within-node scope and a cross-node scope into one
/// cluster-wide [`SyncStrategy`].
///
/// Both leaf scopes are injected at construction. The cross-node scope
/// is initialized only on node leaders (local rank 0) of multi-node
/// clusters; everywhere else it is dropped untouched during `init`.
pub struct HierarchicalStrategy {
    local: Box<dyn SyncStrategy>,
    cross: Option<Box<dyn SyncStrategy>>,
    local_rank: i32,
    local_group_size: i32,
    is_leader: bool,
    state: StrategyState,
}

impl HierarchicalStrategy {
    pub fn new(local: Box<dyn SyncStrategy>, cross: Box<dyn SyncStrategy>) -> Self {
        Self {
            local,
            cross: Some(cross),
            local_rank: 0,
            local_group_size: 0,
            is_leader: false,
            state: StrategyState::Uninitialized,
        }
    }

    /// Rank within this worker's node, valid after `init`.
    pub fn local_rank(&self) -> i32 {
        self.local_rank
    }

    /// Whether this worker is its node's leader, valid after `init`.
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Global rank of the leader of the node hosting `root_rank`.
    /// Assumes uniform node sizes.
    fn node_leader_rank(root_rank: i32, local_group_size: i32) -> i32 {
        root_rank - (root_rank % local_group_size)
    }

    fn ensure_ready(&mut self) -> Result<()> {
        match self.state {
            StrategyState::Initialized | StrategyState::Active => {
                self.state = StrategyState::Active;
                Ok(())
            }
            StrategyState::Uninitialized => Err(SyncError::validation(
                "strategy has not been initialized",
            )),
            StrategyState::ShutDown => {
                Err(SyncError::validation("strategy has been shut down"))
            }
        }
    }
}

fn stage(label: &'static str) -> impl FnOnce(SyncError) -> SyncError {
    move |err| SyncError::collective(label, err.to_string())
}

#[async_trait]
impl SyncStrategy for HierarchicalStrategy {
    async fn init(&mut self, rank: i32, size: i32, coordinator_addr: &str) -> Result<()> {
        if self.state != StrategyState::Uninitialized {
            return Err(SyncError::validation("strategy is already initialized"));
        }

        self.local
            .init(rank, size, coordinator_addr)
            .await
            .map_err(stage("local init"))?;

        let group_size = self.local.size();
        if group_size <= 0 {
            return Err(SyncError::validation(format!(
                "local scope reported non-positive size {group_size}"
            )));
        }
        self.local_group_size = group_size;
        self.local_rank = self.local.rank() % group_size;
        self.is_leader = self.local_rank == 0;

        // Cross-node membership is only needed on leaders, and only
        // when the cluster actually spans more than one node.
        if self.is_leader && size > group_size {
            let mut cross = self
                .cross
                .take()
                .ok_or_else(|| SyncError::validation("cross-node scope is missing"))?;
            cross
                .init(rank, size, coordinator_addr)
                .await
                .map_err(stage("cross-node init"))?;
            self.cross = Some(cross);
        } else {
            self.cross = None;
        }

        self.state = StrategyState::Initialized;
        info!(
            rank,
            size,
            local_rank = self.local_rank,
            is_leader = self.is_leader,
            "hierarchical strategy initialized"
        );
        Ok(())
    }

    /// Local reduce, cross-node reduce on leaders, then a local
    /// broadcast of every tensor from local rank 0. Any stage failure
    /// aborts immediately; the caller must treat the tensors as
    /// indeterminate on error.
    async fn all_reduce_gradients(&mut self, gradients: &mut GradientMap) -> Result<()> {
        self.ensure_ready()?;

        self.local
            .all_reduce_gradients(gradients)
            .await
            .map_err(stage("local all-reduce"))?;

        if let Some(cross) = self.cross.as_mut() {
            cross
                .all_reduce_gradients(gradients)
                .await
                .map_err(stage("cross-node all-reduce"))?;
        }

        // Peers can only pair broadcast collectives by invocation order,
        // so every worker must walk the tensors in the same order; map
        // iteration order is seed-dependent per process.
        let mut names: Vec<String> = gradients.keys().cloned().collect();
        names.sort_unstable();

        for name in &names {
            if let Some(tensor) = gradients.get_mut(name) {
                debug!(tensor = name.as_str(), "broadcasting reduced tensor");
                self.local
                    .broadcast_tensor(tensor.as_mut_slice(), 0)
                    .await
                    .map_err(stage("local broadcast"))?;
            }
        }

        Ok(())
    }

    /// Local barrier, cross-node barrier on leaders, then a second
    /// local barrier so non-leaders cannot run ahead of their leader's
    /// cross-node phase.
    async fn barrier(&mut self) -> Result<()> {
        self.ensure_ready()?;

        self.local.barrier().await.map_err(stage("local barrier"))?;

        if let Some(cross) = self.cross.as_mut() {
            cross
                .barrier()
                .await
                .map_err(stage("cross-node barrier"))?;
        }

        self.local.barrier().await.map_err(stage("local barrier"))?;

        Ok(())
    }

    async fn broadcast_tensor(&mut self, tensor: &mut [f32], root_rank: i32) -> Result<()> {
        self.ensure_ready()?;

        let root_leader = Self::node_leader_rank(root_rank, self.local_group_size);

        if let Some(cross) = self.cross.as_mut() {
            cross
                .broadcast_tensor(tensor, root_leader)
                .await
                .map_err(stage("cross-node broadcast"))?;
        }

        self.local
            .broadcast_tensor(tensor, 0)
            .await
            .map_err(stage("local broadcast"))?;

        Ok(())
    }

    fn rank(&self) -> i32 {
        self.local.rank()
    }

    fn size(&self) -> i32 {
        self.local.size()
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.state == StrategyState::ShutDown {
            return Ok(());
        }

        self.local
            .shutdown()
            .await
            .map_err(stage("local shutdown"))?;

        if let Some(cross) = self.cross.as_mut() {
            cross
                .shutdown()
                .await
                .map_err(stage("cross-node shutdown"))?;
        }

        self.state = StrategyState::ShutDown;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// One recorded leaf-scope call: (scope tag, operation, broadcast root).
    type CallLog = Arc<Mutex<Vec<(&'static str, &'static str, i32)>>>;

    struct MockScope {
        tag: &'static str,
        rank: i32,
        size: i32,
        fail_all_reduce: bool,
        log: CallLog,
        // First element of every broadcast tensor, in call order.
        broadcast_heads: Arc<Mutex<Vec<f32>>>,
    }

    impl MockScope {
        fn new(tag: &'static str, rank: i32, size: i32, log: CallLog) -> Box<Self> {
            Box::new(Self {
                tag,
                rank,
                size,
                fail_all_reduce: false,
                log,
                broadcast_heads: Default::default(),
            })
        }

        fn failing(tag: &'static str, rank: i32, size: i32, log: CallLog) -> Box<Self> {
            Box::new(Self {
                tag,
                rank,
                size,
                fail_all_reduce: true,
                log,
                broadcast_heads: Default::default(),
            })
        }

        fn record(&self, op: &'static str, root: i32) {
            self.log.lock().unwrap().push((self.tag, op, root));
        }
    }

    #[async_trait]
    impl SyncStrategy for MockScope {
        async fn init(&mut self, _rank: i32, _size: i32, _addr: &str) -> Result<()> {
            self.record("init", -1);
            Ok(())
        }

        async fn all_reduce_gradients(&mut self, _gradients: &mut GradientMap) -> Result<()> {
            self.record("all_reduce", -1);
            if self.fail_all_reduce {
                return Err(SyncError::transport("peer connection reset"));
            }
            Ok(())
        }

        async fn barrier(&mut self) -> Result<()> {
            self.record("barrier", -1);
            Ok(())
        }

        async fn broadcast_tensor(&mut self, tensor: &mut [f32], root_rank: i32) -> Result<()> {
            self.record("broadcast", root_rank);
            if let Some(head) = tensor.first() {
                self.broadcast_heads.lock().unwrap().push(*head);
            }
            Ok(())
        }

        fn rank(&self) -> i32 {
            self.rank
        }

        fn size(&self) -> i32 {
            self.size
        }

        async fn shutdown(&mut self) -> Result<()> {
            self.record("shutdown", -1);
            Ok(())
        }
    }

    fn calls_for(log: &CallLog, tag: &str) -> Vec<(&'static str, i32)> {
        log.lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| *t == tag)
            .map(|(_, op, root)| (*op, *root))
            .collect()
    }

    fn gradients() -> GradientMap {
        let mut grads = GradientMap::new();
        grads.insert("layer0.weight".to_string(), vec![1.0, 2.0]);
        grads
    }

    /// rank 4 of 8 with nodes of 4: node leader of the second node.
    fn leader_strategy(log: &CallLog) -> HierarchicalStrategy {
        HierarchicalStrategy::new(
            MockScope::new("local", 4, 4, log.clone()),
            MockScope::new("cross", 4, 2, log.clone()),
        )
    }

    #[tokio::test]
    async fn leader_runs_all_three_all_reduce_stages_in_order() {
        let log: CallLog = Default::default();
        let mut strategy = leader_strategy(&log);
        strategy.init(4, 8, "127.0.0.1:50100").await.unwrap();
        assert!(strategy.is_leader());
        assert_eq!(strategy.local_rank(), 0);

        strategy.all_reduce_gradients(&mut gradients()).await.unwrap();

        assert_eq!(
            calls_for(&log, "local"),
            vec![("init", -1), ("all_reduce", -1), ("broadcast", 0)]
        );
        assert_eq!(
            calls_for(&log, "cross"),
            vec![("init", -1), ("all_reduce", -1)]
        );
    }

    #[tokio::test]
    async fn reduced_tensors_are_broadcast_in_sorted_name_order() {
        let log: CallLog = Default::default();
        let heads: Arc<Mutex<Vec<f32>>> = Default::default();
        let local = Box::new(MockScope {
            tag: "local",
            rank: 4,
            size: 4,
            fail_all_reduce: false,
            log: log.clone(),
            broadcast_heads: heads.clone(),
        });
        let mut strategy =
            HierarchicalStrategy::new(local, MockScope::new("cross", 4, 2, log.clone()));
        strategy.init(4, 8, "127.0.0.1:50100").await.unwrap();

        // Insertion order differs from name order; each head value
        // encodes its tensor's alphabetical position. Peers pair
        // broadcasts by invocation order, so the order must not depend
        // on map iteration.
        let mut grads = GradientMap::new();
        grads.insert("layer2.bias".to_string(), vec![2.0]);
        grads.insert("embedding.weight".to_string(), vec![0.0]);
        grads.insert("layer10.weight".to_string(), vec![1.0]);
        grads.insert("norm.scale".to_string(), vec![3.0]);

        strategy.all_reduce_gradients(&mut grads).await.unwrap();

        assert_eq!(*heads.lock().unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn non_leader_never_touches_the_cross_scope() {
        let log: CallLog = Default::default();
        // rank 6 of 8, node size 4: local rank 2
        let mut strategy = HierarchicalStrategy::new(
            MockScope::new("local", 6, 4, log.clone()),
            MockScope::new("cross", 6, 2, log.clone()),
        );
        strategy.init(6, 8, "127.0.0.1:50100").await.unwrap();
        assert!(!strategy.is_leader());
        assert_eq!(strategy.local_rank(), 2);

        strategy.all_reduce_gradients(&mut gradients()).await.unwrap();
        strategy.barrier().await.unwrap();

        assert!(calls_for(&log, "cross").is_empty());
    }

    #[tokio::test]
    async fn single_node_cluster_never_touches_the_cross_scope() {
        let log: CallLog = Default::default();
        // rank 0 of 4, node size 4: a leader, but there is only one node
        let mut strategy = HierarchicalStrategy::new(
            MockScope::new("local", 0, 4, log.clone()),
            MockScope::new("cross", 0, 1, log.clone()),
        );
        strategy.init(0, 4, "127.0.0.1:50100").await.unwrap();

        strategy.all_reduce_gradients(&mut gradients()).await.unwrap();
        strategy.barrier().await.unwrap();
        let mut tensor = vec![0.0f32; 4];
        strategy.broadcast_tensor(&mut tensor, 2).await.unwrap();
        strategy.shutdown().await.unwrap();

        assert!(calls_for(&log, "cross").is_empty());
    }

    #[tokio::test]
    async fn barrier_runs_local_cross_local() {
        let log: CallLog = Default::default();
        let mut strategy = leader_strategy(&log);
        strategy.init(4, 8, "127.0.0.1:50100").await.unwrap();
        log.lock().unwrap().clear();

        strategy.barrier().await.unwrap();

        let phases: Vec<_> = log
            .lock()
            .unwrap()
            .iter()
            .map(|(tag, op, _)| (*tag, *op))
            .collect();
        assert_eq!(
            phases,
            vec![
                ("local", "barrier"),
                ("cross", "barrier"),
                ("local", "barrier")
            ]
        );
    }

    #[tokio::test]
    async fn local_all_reduce_failure_aborts_later_stages() {
        let log: CallLog = Default::default();
        let mut strategy = HierarchicalStrategy::new(
            MockScope::failing("local", 4, 4, log.clone()),
            MockScope::new("cross", 4, 2, log.clone()),
        );
        strategy.init(4, 8, "127.0.0.1:50100").await.unwrap();
        log.lock().unwrap().clear();

        let err = strategy
            .all_reduce_gradients(&mut gradients())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SyncError::Collective {
                stage: "local all-reduce",
                ..
            }
        ));
        assert!(calls_for(&log, "cross").is_empty());
        // No broadcast stage ran either
        assert_eq!(calls_for(&log, "local"), vec![("all_reduce", -1)]);
    }

    #[tokio::test]
    async fn broadcast_root_resolves_to_the_node_leader() {
        let log: CallLog = Default::default();
        let mut strategy = leader_strategy(&log);
        strategy.init(4, 8, "127.0.0.1:50100").await.unwrap();
        log.lock().unwrap().clear();

        let mut tensor = vec![1.0f32, 2.0, 3.0];
        // root 6 is a non-leader; its node leader is rank 4
        strategy.broadcast_tensor(&mut tensor, 6).await.unwrap();
        // root 4 is that same node's leader
        strategy.broadcast_tensor(&mut tensor, 4).await.unwrap();

        let cross_roots: Vec<i32> = calls_for(&log, "cross")
            .into_iter()
            .map(|(_, root)| root)
            .collect();
        assert_eq!(cross_roots, vec![4, 4]);

        // The node-local phase is always rooted at local rank 0
        let local_roots: Vec<i32> = calls_for(&log, "local")
            .into_iter()
            .map(|(_, root)| root)
            .collect();
        assert_eq!(local_roots, vec![0, 0]);
    }

    #[tokio::test]
    async fn collectives_require_init_and_stop_after_shutdown() {
        let log: CallLog = Default::default();
        let mut strategy = leader_strategy(&log);

        assert!(strategy.barrier().await.is_err());

        strategy.init(4, 8, "127.0.0.1:50100").await.unwrap();
        strategy.barrier().await.unwrap();

        strategy.shutdown().await.unwrap();
        assert!(strategy.barrier().await.is_err());
        // Shutdown released both scopes
        assert!(calls_for(&log, "local").contains(&("shutdown", -1)));
        assert!(calls_for(&log, "cross").contains(&("shutdown", -1)));
    }

    #[tokio::test]
    async fn rank_and_size_pass_through_to_the_local_scope() {
        let log: CallLog = Default::default();
        let strategy = leader_strategy(&log);
        assert_eq!(strategy.rank(), 4);
        assert_eq!(strategy.size(), 4);
    }
}
