//! In-memory state for the membership registry.
//!
//! One coarse lock guards the worker map, the rank table, and the
//! checkpoint records; every handler and the eviction sweep serialize
//! through it, and nothing performs network I/O while holding it.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use gsync_core::error::{Result, SyncError};

/// One registered worker. Owned exclusively by the registry.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: String,
    pub address: String,
    pub rank: i32,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Instant,
}

/// One checkpoint round, snapshotting the worker set live at its start.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub id: String,
    pub epoch: i64,
    pub path: String,
    pub acks: HashMap<String, bool>,
    pub completed: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryTables {
    workers: HashMap<String, WorkerRecord>,
    // rank -> worker id; holes stay after departures, ranks are never reused
    ranks: BTreeMap<i32, String>,
    checkpoints: HashMap<String, CheckpointRecord>,
    next_rank: i32,
}

/// Registry state shared between the gRPC handlers and the eviction
/// sweep.
pub struct RegistryState {
    tables: Mutex<RegistryTables>,
    heartbeat_timeout: Duration,
}

impl RegistryState {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            tables: Mutex::new(RegistryTables::default()),
            heartbeat_timeout,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Register a worker, assigning the next rank and returning it with
    /// the addresses of all live workers in ascending rank order.
    pub async fn register_worker(&self, id: &str, address: &str) -> Result<(i32, Vec<String>)> {
        if id.is_empty() {
            return Err(SyncError::validation("worker_id must not be empty"));
        }

        let mut tables = self.tables.lock().await;

        if tables.workers.contains_key(id) {
            return Err(SyncError::conflict(id));
        }
        if tables.next_rank == i32::MAX {
            return Err(SyncError::range("rank", i64::from(tables.next_rank)));
        }

        let rank = tables.next_rank;
        tables.next_rank += 1;

        tables.workers.insert(
            id.to_string(),
            WorkerRecord {
                id: id.to_string(),
                address: address.to_string(),
                rank,
                registered_at: Utc::now(),
                last_heartbeat: Instant::now(),
            },
        );
        tables.ranks.insert(rank, id.to_string());

        let peers = Self::peer_addresses(&tables);

        info!(
            worker_id = id,
            address, rank, "registered worker ({} live)", peers.len()
        );
        Ok((rank, peers))
    }

    // Dense over live workers only: departed ranks are skipped with a
    // log line rather than failing the registration.
    fn peer_addresses(tables: &RegistryTables) -> Vec<String> {
        let mut peers = Vec::with_capacity(tables.workers.len());
        for rank in 0..tables.next_rank {
            match tables.ranks.get(&rank).and_then(|id| tables.workers.get(id)) {
                Some(record) => peers.push(record.address.clone()),
                None => debug!(rank, "rank has no live worker, skipping"),
            }
        }
        peers
    }

    /// Remove a worker and free its rank slot. The rank counter is
    /// never rewound.
    pub async fn unregister_worker(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(SyncError::validation("worker_id must not be empty"));
        }

        let mut tables = self.tables.lock().await;

        let record = tables
            .workers
            .remove(id)
            .ok_or_else(|| SyncError::not_found("worker", id))?;
        tables.ranks.remove(&record.rank);

        info!(worker_id = id, rank = record.rank, "unregistered worker");
        Ok(())
    }

    /// Refresh a worker's liveness timestamp.
    pub async fn heartbeat(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(SyncError::validation("worker_id must not be empty"));
        }

        let mut tables = self.tables.lock().await;

        let record = tables
            .workers
            .get_mut(id)
            .ok_or_else(|| SyncError::not_found("worker", id))?;
        record.last_heartbeat = Instant::now();

        debug!(worker_id = id, "heartbeat");
        Ok(())
    }

    /// Remove every worker whose heartbeat age exceeds the timeout,
    /// returning their ids. Run by the sweep task at period timeout/2,
    /// which bounds detection of a silent worker to 1.5x the timeout.
    pub async fn evict_stale(&self) -> Vec<String> {
        let now = Instant::now();
        let mut tables = self.tables.lock().await;

        let stale: Vec<String> = tables
            .workers
            .values()
            .filter(|w| now.duration_since(w.last_heartbeat) > self.heartbeat_timeout)
            .map(|w| w.id.clone())
            .collect();

        for id in &stale {
            if let Some(record) = tables.workers.remove(id) {
                tables.ranks.remove(&record.rank);
                warn!(
                    worker_id = id.as_str(),
                    rank = record.rank,
                    "evicted worker after heartbeat timeout"
                );
            }
        }

        stale
    }

    /// Open a checkpoint round for the currently registered worker set.
    /// The id is deterministic per epoch; restarting an epoch resets
    /// its acknowledgements.
    pub async fn start_checkpoint(&self, epoch: i64, path: &str) -> Result<String> {
        if epoch < 0 || epoch > i64::from(i32::MAX) {
            return Err(SyncError::range("epoch", epoch));
        }

        let mut tables = self.tables.lock().await;

        let id = format!("ckpt-{epoch}");
        let acks: HashMap<String, bool> =
            tables.workers.keys().map(|w| (w.clone(), false)).collect();

        if tables.checkpoints.contains_key(&id) {
            warn!(checkpoint_id = id.as_str(), "restarting existing checkpoint");
        }
        info!(
            checkpoint_id = id.as_str(),
            epoch,
            path,
            workers = acks.len(),
            "checkpoint started"
        );

        tables.checkpoints.insert(
            id.clone(),
            CheckpointRecord {
                id: id.clone(),
                epoch,
                path: path.to_string(),
                acks,
                completed: false,
                started_at: Utc::now(),
            },
        );

        Ok(id)
    }

    /// Record one worker's acknowledgement and recompute completion
    /// over the snapshot taken at checkpoint start. Workers that joined
    /// after the snapshot are ignored.
    pub async fn end_checkpoint(
        &self,
        worker_id: &str,
        checkpoint_id: &str,
        epoch: i64,
    ) -> Result<bool> {
        if worker_id.is_empty() {
            return Err(SyncError::validation("worker_id must not be empty"));
        }
        if epoch < 0 || epoch > i64::from(i32::MAX) {
            return Err(SyncError::range("epoch", epoch));
        }

        let mut tables = self.tables.lock().await;

        let record = tables
            .checkpoints
            .get_mut(checkpoint_id)
            .ok_or_else(|| SyncError::not_found("checkpoint", checkpoint_id))?;
        if record.epoch != epoch {
            return Err(SyncError::validation(format!(
                "checkpoint '{checkpoint_id}' belongs to epoch {}, not {epoch}",
                record.epoch
            )));
        }

        match record.acks.get_mut(worker_id) {
            Some(ack) => *ack = true,
            None => {
                warn!(
                    worker_id,
                    checkpoint_id, "acknowledgement from worker outside checkpoint snapshot"
                );
                return Ok(record.completed);
            }
        }

        record.completed = record.acks.values().all(|acked| *acked);
        if record.completed {
            info!(checkpoint_id, epoch, "checkpoint completed");
        }

        Ok(record.completed)
    }

    /// Look up a checkpoint record.
    pub async fn checkpoint(&self, checkpoint_id: &str) -> Option<CheckpointRecord> {
        let tables = self.tables.lock().await;
        tables.checkpoints.get(checkpoint_id).cloned()
    }

    /// Number of registered workers.
    pub async fn worker_count(&self) -> usize {
        let tables = self.tables.lock().await;
        tables.workers.len()
    }

    /// Live worker records in ascending rank order.
    pub async fn live_workers(&self) -> Vec<WorkerRecord> {
        let tables = self.tables.lock().await;
        tables
            .ranks
            .values()
            .filter_map(|id| tables.workers.get(id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RegistryState {
        RegistryState::new(Duration::from_secs(15))
    }

    #[tokio::test]
    async fn ranks_are_assigned_in_call_order() {
        let state = state();
        for i in 0..4 {
            let (rank, _) = state
                .register_worker(&format!("w-{i}"), &format!("10.0.0.{i}:70"))
                .await
                .unwrap();
            assert_eq!(rank, i);
        }
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts_without_advancing_ranks() {
        let state = state();
        state.register_worker("w-0", "10.0.0.1:70").await.unwrap();

        let err = state.register_worker("w-0", "10.0.0.2:70").await.unwrap_err();
        assert!(matches!(err, SyncError::Conflict { .. }));

        // The counter did not advance: the next distinct worker gets rank 1.
        let (rank, _) = state.register_worker("w-1", "10.0.0.2:70").await.unwrap();
        assert_eq!(rank, 1);
    }

    #[tokio::test]
    async fn empty_id_is_rejected() {
        let state = state();
        assert!(matches!(
            state.register_worker("", "10.0.0.1:70").await.unwrap_err(),
            SyncError::Validation { .. }
        ));
        assert!(matches!(
            state.heartbeat("").await.unwrap_err(),
            SyncError::Validation { .. }
        ));
        assert!(matches!(
            state.unregister_worker("").await.unwrap_err(),
            SyncError::Validation { .. }
        ));
    }

    #[tokio::test]
    async fn departed_ranks_are_never_reused() {
        let state = state();
        state.register_worker("a", "10.0.0.1:70").await.unwrap();
        state.register_worker("b", "10.0.0.2:70").await.unwrap();
        state.unregister_worker("a").await.unwrap();

        let (rank, peers) = state.register_worker("c", "10.0.0.3:70").await.unwrap();
        assert_eq!(rank, 2);
        // Rank 0 is a hole now; the peer list stays dense over live
        // workers in rank order.
        assert_eq!(peers, vec!["10.0.0.2:70", "10.0.0.3:70"]);

        let live = state.live_workers().await;
        let ids: Vec<&str> = live.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(live[0].rank, 1);
        assert_eq!(live[1].rank, 2);
    }

    #[tokio::test]
    async fn unknown_worker_heartbeat_and_unregister_fail() {
        let state = state();
        assert!(matches!(
            state.heartbeat("ghost").await.unwrap_err(),
            SyncError::NotFound { .. }
        ));
        assert!(matches!(
            state.unregister_worker("ghost").await.unwrap_err(),
            SyncError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn silent_workers_are_evicted_and_fresh_ones_kept() {
        let state = RegistryState::new(Duration::from_millis(40));
        state.register_worker("stale", "10.0.0.1:70").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        state.register_worker("fresh", "10.0.0.2:70").await.unwrap();

        let evicted = state.evict_stale().await;
        assert_eq!(evicted, vec!["stale".to_string()]);
        assert_eq!(state.worker_count().await, 1);

        // The evicted worker's rank slot is freed but never reissued.
        let (rank, peers) = state.register_worker("late", "10.0.0.3:70").await.unwrap();
        assert_eq!(rank, 2);
        assert_eq!(peers, vec!["10.0.0.2:70", "10.0.0.3:70"]);
    }

    #[tokio::test]
    async fn heartbeat_keeps_a_worker_alive() {
        let state = RegistryState::new(Duration::from_millis(50));
        state.register_worker("w-0", "10.0.0.1:70").await.unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            state.heartbeat("w-0").await.unwrap();
            assert!(state.evict_stale().await.is_empty());
        }
    }

    #[tokio::test]
    async fn checkpoint_id_is_deterministic() {
        let state = state();
        let id = state.start_checkpoint(7, "/ckpt/epoch7").await.unwrap();
        assert_eq!(id, "ckpt-7");
    }

    #[tokio::test]
    async fn checkpoint_completes_only_after_every_snapshot_ack() {
        let state = state();
        state.register_worker("a", "10.0.0.1:70").await.unwrap();
        state.register_worker("b", "10.0.0.2:70").await.unwrap();

        let id = state.start_checkpoint(3, "/ckpt/epoch3").await.unwrap();

        // A worker joining after the snapshot does not gate completion.
        state.register_worker("late", "10.0.0.3:70").await.unwrap();

        assert!(!state.end_checkpoint("a", &id, 3).await.unwrap());
        assert!(!state.checkpoint(&id).await.unwrap().completed);

        assert!(state.end_checkpoint("b", &id, 3).await.unwrap());
        assert!(state.checkpoint(&id).await.unwrap().completed);
    }

    #[tokio::test]
    async fn ack_from_outside_the_snapshot_is_ignored() {
        let state = state();
        state.register_worker("a", "10.0.0.1:70").await.unwrap();
        let id = state.start_checkpoint(1, "/ckpt").await.unwrap();
        state.register_worker("late", "10.0.0.2:70").await.unwrap();

        assert!(!state.end_checkpoint("late", &id, 1).await.unwrap());
        assert!(state.end_checkpoint("a", &id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_checkpoint_and_epoch_bounds_are_rejected() {
        let state = state();
        assert!(matches!(
            state.end_checkpoint("a", "ckpt-99", 99).await.unwrap_err(),
            SyncError::NotFound { .. }
        ));
        assert!(matches!(
            state
                .start_checkpoint(i64::from(i32::MAX) + 1, "/ckpt")
                .await
                .unwrap_err(),
            SyncError::Range { .. }
        ));
        assert!(matches!(
            state.start_checkpoint(-1, "/ckpt").await.unwrap_err(),
            SyncError::Range { .. }
        ));
    }

    #[tokio::test]
    async fn end_checkpoint_validates_the_epoch() {
        let state = state();
        state.register_worker("a", "10.0.0.1:70").await.unwrap();
        let id = state.start_checkpoint(5, "/ckpt").await.unwrap();

        assert!(matches!(
            state.end_checkpoint("a", &id, 6).await.unwrap_err(),
            SyncError::Validation { .. }
        ));
    }
}
