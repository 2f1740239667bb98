//! Inbound server lifecycle for gRPC services.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Router;
use tracing::{error, info};

use crate::error::{Result, SyncError};

/// Binds a listener and serves a tonic [`Router`] on a detached task.
///
/// Bind failures are returned synchronously from [`ServerManager::start`];
/// failures while serving are reported through the log, since serving
/// runs detached from the caller.
#[derive(Default)]
pub struct ServerManager {
    handle: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

impl ServerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `address` and begin serving `router`. Returns the bound
    /// socket address, so `:0` may be used to pick a free port.
    pub async fn start(&mut self, address: &str, router: Router) -> Result<SocketAddr> {
        if self.handle.is_some() {
            return Err(SyncError::validation("server is already running"));
        }

        let addr: SocketAddr = address.parse().map_err(|e| {
            SyncError::validation(format!("invalid listen address '{address}': {e}"))
        })?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            SyncError::transport_with_source(format!("failed to bind {address}"), e)
        })?;
        let local_addr = listener.local_addr().map_err(|e| {
            SyncError::transport_with_source("failed to read bound address", e)
        })?;

        let incoming = TcpListenerStream::new(listener);
        let (tx, rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let shutdown = async {
                let _ = rx.await;
            };
            if let Err(e) = router.serve_with_incoming_shutdown(incoming, shutdown).await {
                error!(address = %local_addr, "server terminated with error: {e}");
            }
        });

        self.handle = Some(handle);
        self.shutdown = Some(tx);
        self.local_addr = Some(local_addr);

        info!(address = %local_addr, "server started");
        Ok(local_addr)
    }

    /// Address the server is bound to, if running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Tear the server down immediately, dropping in-flight requests.
    pub fn stop(&mut self) {
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("server stopped");
        }
        self.local_addr = None;
    }

    /// Stop accepting new connections, drain in-flight requests, then
    /// shut down.
    pub async fn graceful_stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
            info!("server stopped gracefully");
        }
        self.local_addr = None;
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
