//! Outbound connections to collective-transport peers.

use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::proto::collective_transport_client::CollectiveTransportClient;

/// Connection set produced by [`connect_to_peers`]. Both vectors are
/// indexed by rank, with `None` at the caller's own slot. The caller
/// owns the channels and must route them through [`close_connections`]
/// on teardown.
#[derive(Debug)]
pub struct PeerConnections {
    pub clients: Vec<Option<CollectiveTransportClient<Channel>>>,
    pub channels: Vec<Option<Channel>>,
}

/// Dial every peer address except the one at `self_rank`.
///
/// On any dial failure, every connection already opened by this call
/// is closed before the error is returned; the error path never leaks
/// connections.
pub async fn connect_to_peers(
    peers: &[String],
    self_rank: usize,
    timeout: Duration,
) -> Result<PeerConnections> {
    let mut clients = Vec::with_capacity(peers.len());
    let mut channels = Vec::with_capacity(peers.len());

    for (rank, address) in peers.iter().enumerate() {
        if rank == self_rank {
            clients.push(None);
            channels.push(None);
            continue;
        }

        let channel = match dial(address, timeout).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(
                    peer_rank = rank,
                    address = address.as_str(),
                    "peer dial failed, rolling back {} open connections",
                    channels.iter().filter(|c| c.is_some()).count()
                );
                close_connections(channels);
                return Err(e);
            }
        };

        debug!(peer_rank = rank, address = address.as_str(), "connected to peer");
        clients.push(Some(CollectiveTransportClient::new(channel.clone())));
        channels.push(Some(channel));
    }

    Ok(PeerConnections { clients, channels })
}

async fn dial(address: &str, timeout: Duration) -> Result<Channel> {
    let endpoint = Endpoint::from_shared(format!("http://{address}"))
        .map_err(|e| {
            SyncError::transport_with_source(format!("invalid peer address '{address}'"), e)
        })?
        .connect_timeout(timeout);

    endpoint.connect().await.map_err(|e| {
        SyncError::transport_with_source(format!("failed to connect to peer at {address}"), e)
    })
}

/// Close every non-empty connection in the set. Individual closes are
/// logged, never propagated, so one bad connection cannot abort the
/// sweep.
pub fn close_connections(channels: Vec<Option<Channel>>) {
    for (rank, channel) in channels.into_iter().enumerate() {
        if let Some(channel) = channel {
            // Dropping the last handle tears the connection down.
            drop(channel);
            debug!(peer_rank = rank, "closed peer connection");
        }
    }
}
