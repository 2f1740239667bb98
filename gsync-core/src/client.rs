//! gRPC client for the membership registry.
//!
//! Workers register here to obtain a rank and peer list, keep their
//! record alive with heartbeats, and coordinate checkpoint rounds.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tonic::transport::{Channel, Endpoint};
use tonic::Request;
use tracing::warn;

use crate::config::WorkerConfig;
use crate::error::{Result, SyncError};
use crate::proto::worker_registry_client::WorkerRegistryClient;
use crate::proto::{
    EndCheckpointRequest, HeartbeatRequest, RegisterWorkerRequest, StartCheckpointRequest,
    UnregisterWorkerRequest,
};

/// Client-side view of one worker's registry session.
pub struct RegistryClient {
    config: WorkerConfig,
    worker_id: String,
    client: Option<WorkerRegistryClient<Channel>>,
    rank: Option<i32>,
}

impl RegistryClient {
    pub fn new(worker_id: impl Into<String>, config: WorkerConfig) -> Self {
        Self {
            config,
            worker_id: worker_id.into(),
            client: None,
            rank: None,
        }
    }

    /// Connect to the registry service.
    pub async fn connect(&mut self) -> Result<()> {
        let address = &self.config.coordinator_address;
        let endpoint = Endpoint::from_shared(format!("http://{address}"))
            .map_err(|e| {
                SyncError::transport_with_source(
                    format!("invalid coordinator address '{address}'"),
                    e,
                )
            })?
            .connect_timeout(Duration::from_millis(self.config.connect_timeout_ms))
            .timeout(Duration::from_millis(self.config.request_timeout_ms));

        let channel = endpoint.connect().await.map_err(|e| {
            SyncError::transport_with_source(
                format!("failed to connect to coordinator at {address}"),
                e,
            )
        })?;

        self.client = Some(WorkerRegistryClient::new(channel));
        Ok(())
    }

    /// Connect with exponential backoff.
    pub async fn connect_with_retry(&mut self) -> Result<()> {
        let mut attempts = 0;
        let mut delay = Duration::from_millis(self.config.reconnect_delay_ms);

        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.max_reconnect_attempts {
                        return Err(SyncError::transport(format!(
                            "failed to connect after {attempts} attempts: {e}"
                        )));
                    }

                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(
                        delay * 2,
                        Duration::from_millis(self.config.request_timeout_ms),
                    );
                }
            }
        }
    }

    fn get_client(&self) -> Result<&WorkerRegistryClient<Channel>> {
        self.client
            .as_ref()
            .ok_or_else(|| SyncError::transport("not connected to coordinator"))
    }

    /// Register this worker, storing and returning the assigned rank
    /// together with the live peer list in rank order.
    pub async fn register(&mut self, address: &str) -> Result<(i32, Vec<String>)> {
        let mut client = self.get_client()?.clone();

        let request = Request::new(RegisterWorkerRequest {
            worker_id: self.worker_id.clone(),
            address: address.to_string(),
        });

        let response = client
            .register_worker(request)
            .await
            .map_err(|e| SyncError::transport_with_source("worker registration failed", e))?
            .into_inner();

        self.rank = Some(response.rank);
        Ok((response.rank, response.peers))
    }

    /// Deregister this worker (graceful shutdown).
    pub async fn unregister(&self) -> Result<()> {
        let mut client = self.get_client()?.clone();

        let request = Request::new(UnregisterWorkerRequest {
            worker_id: self.worker_id.clone(),
        });

        client
            .unregister_worker(request)
            .await
            .map_err(|e| SyncError::transport_with_source("failed to unregister worker", e))?;

        Ok(())
    }

    /// Refresh this worker's liveness record.
    pub async fn heartbeat(&self) -> Result<String> {
        let mut client = self.get_client()?.clone();

        let request = Request::new(HeartbeatRequest {
            worker_id: self.worker_id.clone(),
        });

        let response = client
            .heartbeat(request)
            .await
            .map_err(|e| SyncError::transport_with_source("heartbeat failed", e))?;

        Ok(response.into_inner().status)
    }

    /// Open a checkpoint round for the current worker set.
    pub async fn start_checkpoint(&self, epoch: i64, path: &str) -> Result<String> {
        let mut client = self.get_client()?.clone();

        let request = Request::new(StartCheckpointRequest {
            epoch,
            path: path.to_string(),
        });

        let response = client
            .start_checkpoint(request)
            .await
            .map_err(|e| SyncError::transport_with_source("failed to start checkpoint", e))?;

        Ok(response.into_inner().checkpoint_id)
    }

    /// Acknowledge a checkpoint on behalf of this worker.
    pub async fn end_checkpoint(&self, epoch: i64, checkpoint_id: &str) -> Result<()> {
        let mut client = self.get_client()?.clone();

        let request = Request::new(EndCheckpointRequest {
            worker_id: self.worker_id.clone(),
            epoch,
            checkpoint_id: checkpoint_id.to_string(),
        });

        client
            .end_checkpoint(request)
            .await
            .map_err(|e| SyncError::transport_with_source("failed to end checkpoint", e))?;

        Ok(())
    }

    /// Rank assigned at registration, if registered.
    pub fn rank(&self) -> Option<i32> {
        self.rank
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }
}

/// Background heartbeat loop that runs while the worker is active.
pub struct HeartbeatTask {
    client: Arc<Mutex<RegistryClient>>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl HeartbeatTask {
    pub fn new(
        client: Arc<Mutex<RegistryClient>>,
        interval_ms: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            interval: Duration::from_millis(interval_ms),
            shutdown,
        }
    }

    /// Run until the shutdown signal flips. Heartbeat failures are
    /// logged and retried on the next tick; retry policy beyond that
    /// is the caller's concern.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let client = self.client.lock().await;
                    if let Err(e) = client.heartbeat().await {
                        warn!("heartbeat failed: {e}");
                    }
                }
                changed = self.shutdown.changed() => {
                    // A closed channel means the owner is gone; stop
                    // rather than spin on the error.
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
