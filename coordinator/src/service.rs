//! gRPC service implementation for the membership registry.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use gsync_core::proto::worker_registry_server::WorkerRegistry;
use gsync_core::proto::{
    EndCheckpointRequest, EndCheckpointResponse, HeartbeatRequest, HeartbeatResponse,
    RegisterWorkerRequest, RegisterWorkerResponse, StartCheckpointRequest,
    StartCheckpointResponse, UnregisterWorkerRequest, UnregisterWorkerResponse,
};

use crate::state::RegistryState;

pub struct RegistryService {
    state: Arc<RegistryState>,
}

impl RegistryService {
    pub fn new(state: Arc<RegistryState>) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl WorkerRegistry for RegistryService {
    async fn register_worker(
        &self,
        request: Request<RegisterWorkerRequest>,
    ) -> Result<Response<RegisterWorkerResponse>, Status> {
        let req = request.into_inner();

        let (rank, peers) = self
            .state
            .register_worker(&req.worker_id, &req.address)
            .await?;

        Ok(Response::new(RegisterWorkerResponse { rank, peers }))
    }

    async fn unregister_worker(
        &self,
        request: Request<UnregisterWorkerRequest>,
    ) -> Result<Response<UnregisterWorkerResponse>, Status> {
        let req = request.into_inner();

        self.state.unregister_worker(&req.worker_id).await?;

        Ok(Response::new(UnregisterWorkerResponse {}))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();

        self.state.heartbeat(&req.worker_id).await?;

        Ok(Response::new(HeartbeatResponse {
            status: "OK".to_string(),
        }))
    }

    async fn start_checkpoint(
        &self,
        request: Request<StartCheckpointRequest>,
    ) -> Result<Response<StartCheckpointResponse>, Status> {
        let req = request.into_inner();

        let checkpoint_id = self.state.start_checkpoint(req.epoch, &req.path).await?;

        Ok(Response::new(StartCheckpointResponse { checkpoint_id }))
    }

    async fn end_checkpoint(
        &self,
        request: Request<EndCheckpointRequest>,
    ) -> Result<Response<EndCheckpointResponse>, Status> {
        let req = request.into_inner();

        self.state
            .end_checkpoint(&req.worker_id, &req.checkpoint_id, req.epoch)
            .await?;

        Ok(Response::new(EndCheckpointResponse {}))
    }
}
