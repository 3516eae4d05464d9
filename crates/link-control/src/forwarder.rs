//! Per-tenant forwarder
//!
//! Owns the tenant's public listener. Every accepted SQL client connection
//! becomes one mux stream back to the agent, spliced byte-for-byte in both
//! directions. The relay never inspects or authenticates the payload; the
//! SQL server at the far end does.

use crate::registry::TenantSession;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

const READ_BUF_SIZE: usize = 8192;

/// Accept loop for one tenant's public port
///
/// Exits when the listener errors (teardown aborts this task) without
/// releasing the port; teardown owns the release.
pub async fn run_forwarder(
    listener: TcpListener,
    session: Arc<TenantSession>,
    max_connections: usize,
) {
    loop {
        let (client, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(
                    tenant_id = %session.tenant_id,
                    "Public listener closed: {}", e
                );
                return;
            }
        };

        if max_connections > 0 && session.active_streams() >= max_connections {
            warn!(
                tenant_id = %session.tenant_id,
                limit = max_connections,
                "Connection limit reached, dropping client {}", peer_addr
            );
            drop(client);
            continue;
        }

        let stream = match session.mux().open_stream() {
            Ok(stream) => stream,
            Err(e) => {
                // Mux session is dead; teardown will follow shortly
                debug!(
                    tenant_id = %session.tenant_id,
                    "Failed to open stream for {}: {}", peer_addr, e
                );
                drop(client);
                continue;
            }
        };

        debug!(
            tenant_id = %session.tenant_id,
            stream_id = stream.stream_id(),
            "Forwarding connection from {}", peer_addr
        );

        session.stream_opened();
        let session = session.clone();
        tokio::spawn(async move {
            splice(client, stream, &session).await;
            session.stream_closed();
        });
    }
}

/// Pump bytes both ways until either side ends; the survivor is torn down
async fn splice(client: TcpStream, stream: link_proto::MuxStream, session: &TenantSession) {
    let stream_id = stream.stream_id();
    let (mut client_read, mut client_write) = client.into_split();
    let (stream_tx, mut stream_rx) = stream.split();

    let mut client_to_stream = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) => {
                    stream_tx.close();
                    break;
                }
                Ok(n) => {
                    if stream_tx.send(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut stream_to_client = tokio::spawn(async move {
        while let Some(chunk) = stream_rx.recv().await {
            if client_write.write_all(&chunk).await.is_err() {
                break;
            }
            if client_write.flush().await.is_err() {
                break;
            }
        }
        let _ = client_write.shutdown().await;
    });

    // First direction to finish wins; the other is torn down with it
    tokio::select! {
        _ = &mut client_to_stream => {
            stream_to_client.abort();
            let _ = stream_to_client.await;
        }
        _ = &mut stream_to_client => {
            client_to_stream.abort();
            let _ = client_to_stream.await;
        }
    }

    debug!(
        tenant_id = %session.tenant_id,
        stream_id,
        "Forwarded connection closed"
    );
}
