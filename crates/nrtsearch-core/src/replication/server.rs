//! Replication endpoint
//!
//! Both primaries and replicas run one. A primary answers the full message set;
//! a replica completes the handshake and answers pings, but rejects every
//! request that reads or writes NRT points with a role error.

use super::protocol::{PROTOCOL_VERSION, ReplicationMessage};
use super::publisher::ReplicationPublisher;
use crate::node::IndexNode;
use crate::nrt::{PointLease, Version};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Per-connection state
#[derive(Default)]
struct Session {
    peer: Option<String>,
    lease: Option<PointLease>,
}

/// TCP replication endpoint for one node
pub struct ReplicationServer {
    node: Arc<IndexNode>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    chunk_size: usize,
    shutdown_tx: watch::Sender<bool>,
    connections: Arc<AtomicUsize>,
}

impl ReplicationServer {
    /// Bind the endpoint; the node's identity records the bound address
    pub async fn bind(addr: SocketAddr, node: Arc<IndexNode>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        node.set_replication_endpoint(local_addr);
        tracing::info!(
            "Replication endpoint for {} ({}) listening on {}",
            node.index_name(),
            node.role(),
            local_addr
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            chunk_size: node.config().replication.chunk_size.max(1),
            node,
            listener: Mutex::new(Some(listener)),
            local_addr,
            shutdown_tx,
            connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Open connections
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Accept connections until [`ReplicationServer::stop`] is called
    pub async fn serve(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| Error::replication("Replication endpoint already serving"))?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let _ = stream.set_nodelay(true);
                            let node = self.node.clone();
                            let shutdown = self.shutdown_tx.subscribe();
                            let connections = self.connections.clone();
                            let chunk_size = self.chunk_size;
                            connections.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(async move {
                                handle_connection(node, stream, addr, chunk_size, shutdown).await;
                                connections.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    tracing::info!("Replication endpoint {} shutting down", self.local_addr);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Serve on a background task
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let server = self.clone();
        tokio::spawn(async move { server.serve().await })
    }

    /// Stop accepting and close open connections
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

async fn handle_connection(
    node: Arc<IndexNode>,
    mut stream: TcpStream,
    addr: SocketAddr,
    chunk_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!("Replication connection from {}", addr);
    let mut session = Session::default();

    loop {
        let message = tokio::select! {
            result = ReplicationMessage::read_from(&mut stream) => match result {
                Ok(message) => message,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    tracing::warn!("Dropping replication connection from {}: {}", addr, e);
                    break;
                }
            },
            _ = shutdown.changed() => break,
        };

        // a lease only survives until the transfer it was planned for
        if !matches!(message, ReplicationMessage::FetchFiles { .. }) {
            session.lease = None;
        }

        if let Err(e) = dispatch(&node, &mut session, message, &mut stream, chunk_size).await {
            tracing::debug!("Request from {} failed: {}", addr, e);
            if ReplicationMessage::from_error(&e)
                .write_to(&mut stream)
                .await
                .is_err()
            {
                break;
            }
            if session.peer.is_none() {
                break;
            }
        }
    }

    match session.peer {
        Some(peer) => tracing::info!("Replication peer {} ({}) disconnected", peer, addr),
        None => tracing::debug!("Replication connection from {} closed", addr),
    }
}

async fn dispatch(
    node: &Arc<IndexNode>,
    session: &mut Session,
    message: ReplicationMessage,
    stream: &mut TcpStream,
    chunk_size: usize,
) -> Result<()> {
    match message {
        ReplicationMessage::Hello {
            node_name,
            index_name,
            protocol_version,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(Error::replication(format!(
                    "Protocol version mismatch: expected {}, got {}",
                    PROTOCOL_VERSION, protocol_version
                )));
            }
            if index_name != node.index_name() {
                return Err(Error::IndexNotFound(index_name));
            }
            tracing::info!("Replication peer {} connected", node_name);
            session.peer = Some(node_name);
            ReplicationMessage::Welcome {
                node_name: node.node_name().to_string(),
                is_primary: node.is_primary(),
                current_version: node.current_version(),
            }
            .write_to(stream)
            .await
        }

        ReplicationMessage::Ping { timestamp } => {
            ReplicationMessage::Pong { timestamp }.write_to(stream).await
        }

        _ if session.peer.is_none() => Err(Error::replication("Hello required before requests")),

        ReplicationMessage::GetLatestPoint => {
            let publisher = node.publisher("getLatestPoint")?;
            let point = publisher.latest_point();
            ReplicationMessage::LatestPoint {
                point: (*point).clone(),
            }
            .write_to(stream)
            .await
        }

        ReplicationMessage::GetSegmentFiles { since_version } => {
            let publisher = node.publisher("getSegmentFiles")?;
            let plan = publisher.get_segment_files(since_version);
            tracing::debug!(
                "Transfer plan for {:?}: version {} from {:?} ({} files, full copy: {})",
                session.peer,
                plan.point().version,
                since_version,
                plan.delta.added.len(),
                plan.full_copy
            );
            let has_files = !plan.delta.added.is_empty();
            let header = ReplicationMessage::TransferHeader {
                point: (**plan.point()).clone(),
                full_copy: plan.full_copy,
                delta: plan.delta,
            };
            session.lease = has_files.then_some(plan.lease);
            header.write_to(stream).await
        }

        ReplicationMessage::FetchFiles { version, names } => {
            let publisher = node.publisher("fetchFiles")?.clone();
            let lease = match session.lease.take() {
                Some(lease) if lease.version() == version => lease,
                other => {
                    session.lease = other;
                    return Err(Error::replication(format!(
                        "Version {} is not leased on this connection",
                        version
                    )));
                }
            };
            let (files, bytes) = send_files(&publisher, &lease, version, &names, stream, chunk_size).await?;
            drop(lease);
            publisher.finish_transfer(files, bytes);
            Ok(())
        }

        ReplicationMessage::WriteNrtPoint { index_name } => {
            let result = node.write_nrt_point(&index_name).await?;
            ReplicationMessage::SearcherVersion {
                version: result.version,
                did_refresh: result.did_refresh,
            }
            .write_to(stream)
            .await
        }

        other => Err(Error::replication(format!(
            "Unexpected {:?} request",
            other.message_type()
        ))),
    }
}

async fn send_files(
    publisher: &Arc<ReplicationPublisher>,
    lease: &PointLease,
    version: Version,
    names: &[String],
    stream: &mut TcpStream,
    chunk_size: usize,
) -> Result<(u64, u64)> {
    let mut bytes_sent = 0u64;
    for name in names {
        let bytes = {
            let publisher = publisher.clone();
            let point = lease.point().clone();
            let name = name.clone();
            tokio::task::spawn_blocking(move || publisher.read_file(&point, &name))
                .await
                .map_err(|e| Error::internal(format!("File read task failed: {}", e)))??
        };

        if bytes.is_empty() {
            ReplicationMessage::FileChunk {
                name: name.clone(),
                chunk_index: 0,
                last: true,
                data: Vec::new(),
                checksum: crc32fast::hash(&[]),
            }
            .write_to(stream)
            .await?;
            continue;
        }

        let chunk_count = bytes.len().div_ceil(chunk_size);
        for (idx, chunk) in bytes.chunks(chunk_size).enumerate() {
            ReplicationMessage::FileChunk {
                name: name.clone(),
                chunk_index: idx as u32,
                last: idx + 1 == chunk_count,
                data: chunk.to_vec(),
                checksum: crc32fast::hash(chunk),
            }
            .write_to(stream)
            .await?;
        }
        bytes_sent += bytes.len() as u64;
    }

    ReplicationMessage::TransferComplete {
        version,
        files: names.len() as u32,
        bytes: bytes_sent,
    }
    .write_to(stream)
    .await?;

    tracing::debug!(
        "Sent {} files ({} bytes) of version {}",
        names.len(),
        bytes_sent,
        version
    );
    Ok((names.len() as u64, bytes_sent))
}
