//! Client side of the replication endpoint
//!
//! A [`PrimaryConnection`] is one TCP connection to a node's replication
//! endpoint after a successful Hello/Welcome handshake. Every frame read is
//! bounded by the configured read timeout.

use super::protocol::{PROTOCOL_VERSION, ReplicationMessage};
use super::publisher::SearcherVersion;
use crate::nrt::{ManifestDelta, NrtPoint, SegmentFile, Version};
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Transfer header as received by a replica
#[derive(Debug, Clone)]
pub struct TransferHeader {
    /// Target point
    pub point: NrtPoint,
    /// True when the replica's version was unknown or pruned
    pub full_copy: bool,
    /// Files added/removed relative to the replica's version
    pub delta: ManifestDelta,
}

/// Files written to a staging directory by [`PrimaryConnection::fetch_files`]
#[derive(Debug, Default)]
pub struct FetchedFiles {
    /// Staged path per file name
    pub staged: HashMap<String, PathBuf>,
    /// Total bytes received
    pub bytes: u64,
}

/// Connection to a replication endpoint
pub struct PrimaryConnection {
    stream: TcpStream,
    addr: SocketAddr,
    read_timeout: Duration,
    peer_name: String,
    peer_is_primary: bool,
    peer_version: Version,
}

impl PrimaryConnection {
    /// Connect and perform the handshake
    pub async fn connect(
        addr: SocketAddr,
        node_name: &str,
        index_name: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        tracing::debug!("Connecting to replication endpoint {}", addr);
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::timeout(format!("Connecting to {}", addr)))??;
        stream.set_nodelay(true)?;

        let mut connection = Self {
            stream,
            addr,
            read_timeout,
            peer_name: String::new(),
            peer_is_primary: false,
            peer_version: 0,
        };

        let hello = ReplicationMessage::Hello {
            node_name: node_name.to_string(),
            index_name: index_name.to_string(),
            protocol_version: PROTOCOL_VERSION,
        };
        match connection.request(&hello).await? {
            ReplicationMessage::Welcome {
                node_name,
                is_primary,
                current_version,
            } => {
                tracing::debug!(
                    "Connected to {} at {} (primary: {}, version {})",
                    node_name,
                    addr,
                    is_primary,
                    current_version
                );
                connection.peer_name = node_name;
                connection.peer_is_primary = is_primary;
                connection.peer_version = current_version;
            }
            other => return Err(unexpected("Welcome", &other)),
        }
        Ok(connection)
    }

    /// Remote address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Node name announced by the peer
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// Whether the peer is the primary for the index
    pub fn peer_is_primary(&self) -> bool {
        self.peer_is_primary
    }

    /// Version announced in the handshake
    pub fn peer_version(&self) -> Version {
        self.peer_version
    }

    /// Latest published point on the primary
    pub async fn latest_point(&mut self) -> Result<NrtPoint> {
        match self.request(&ReplicationMessage::GetLatestPoint).await? {
            ReplicationMessage::LatestPoint { point } => Ok(point),
            other => Err(unexpected("LatestPoint", &other)),
        }
    }

    /// Ask what is needed to reach the latest point; `None` asks for a full copy
    pub async fn get_segment_files(&mut self, since_version: Option<Version>) -> Result<TransferHeader> {
        match self
            .request(&ReplicationMessage::GetSegmentFiles { since_version })
            .await?
        {
            ReplicationMessage::TransferHeader {
                point,
                full_copy,
                delta,
            } => Ok(TransferHeader {
                point,
                full_copy,
                delta,
            }),
            other => Err(unexpected("TransferHeader", &other)),
        }
    }

    /// Fetch `files` of the leased `version` into `staging_dir`.
    ///
    /// Chunk checksums are verified on arrival; whole-file checksums are left
    /// to the engine when the file is installed.
    pub async fn fetch_files(
        &mut self,
        version: Version,
        files: &[SegmentFile],
        staging_dir: &Path,
    ) -> Result<FetchedFiles> {
        let names: Vec<String> = files.iter().map(|f| f.name.clone()).collect();
        ReplicationMessage::FetchFiles { version, names }
            .write_to(&mut self.stream)
            .await?;

        let mut fetched = FetchedFiles::default();
        let mut current: Option<(String, tokio::fs::File, u32)> = None;

        loop {
            match self.recv().await? {
                ReplicationMessage::FileChunk {
                    name,
                    chunk_index,
                    last,
                    data,
                    checksum,
                } => {
                    if crc32fast::hash(&data) != checksum {
                        return Err(Error::replication(format!(
                            "Chunk {} of {} failed its checksum",
                            chunk_index, name
                        )));
                    }
                    if !files.iter().any(|f| f.name == name) {
                        return Err(Error::replication(format!("Unrequested file {}", name)));
                    }

                    let (file_name, mut file, expected_index) = match current.take() {
                        Some(open) if open.0 == name => open,
                        Some(open) => {
                            return Err(Error::replication(format!(
                                "Transfer of {} interrupted by {}",
                                open.0, name
                            )));
                        }
                        None => {
                            let path = staging_dir.join(&name);
                            let file = tokio::fs::File::create(&path).await?;
                            fetched.staged.insert(name.clone(), path);
                            (name, file, 0)
                        }
                    };
                    if chunk_index != expected_index {
                        return Err(Error::replication(format!(
                            "Chunk index mismatch for {}: expected {}, got {}",
                            file_name, expected_index, chunk_index
                        )));
                    }

                    file.write_all(&data).await?;
                    fetched.bytes += data.len() as u64;
                    if last {
                        file.sync_all().await?;
                    } else {
                        current = Some((file_name, file, expected_index + 1));
                    }
                }
                ReplicationMessage::TransferComplete {
                    version: completed,
                    files: count,
                    ..
                } => {
                    if let Some((name, _, _)) = current {
                        return Err(Error::replication(format!("Transfer ended inside {}", name)));
                    }
                    if completed != version || count as usize != fetched.staged.len() {
                        return Err(Error::replication(format!(
                            "Truncated transfer: got {} of {} files for version {}",
                            fetched.staged.len(),
                            count,
                            completed
                        )));
                    }
                    return Ok(fetched);
                }
                other => return Err(unexpected("FileChunk", &other)),
            }
        }
    }

    /// Trigger a refresh on the peer
    pub async fn write_nrt_point(&mut self, index_name: &str) -> Result<SearcherVersion> {
        let request = ReplicationMessage::WriteNrtPoint {
            index_name: index_name.to_string(),
        };
        match self.request(&request).await? {
            ReplicationMessage::SearcherVersion {
                version,
                did_refresh,
            } => Ok(SearcherVersion {
                version,
                did_refresh,
            }),
            other => Err(unexpected("SearcherVersion", &other)),
        }
    }

    /// Round-trip a heartbeat
    pub async fn ping(&mut self) -> Result<Duration> {
        let started = std::time::Instant::now();
        let timestamp = chrono::Utc::now().timestamp_millis() as u64;
        match self.request(&ReplicationMessage::Ping { timestamp }).await? {
            ReplicationMessage::Pong { timestamp: echoed } if echoed == timestamp => Ok(started.elapsed()),
            other => Err(unexpected("Pong", &other)),
        }
    }

    async fn request(&mut self, message: &ReplicationMessage) -> Result<ReplicationMessage> {
        message.write_to(&mut self.stream).await?;
        self.recv().await
    }

    /// Read one frame; error frames become [`Error::Remote`]
    async fn recv(&mut self) -> Result<ReplicationMessage> {
        let message = tokio::time::timeout(
            self.read_timeout,
            ReplicationMessage::read_from(&mut self.stream),
        )
        .await
        .map_err(|_| Error::timeout(format!("No response from {} within {:?}", self.addr, self.read_timeout)))??;

        match message {
            ReplicationMessage::Error { code, message } => Err(Error::Remote { code, message }),
            other => Ok(other),
        }
    }
}

fn unexpected(expected: &str, got: &ReplicationMessage) -> Error {
    Error::replication(format!(
        "Expected {} message, got {:?}",
        expected,
        got.message_type()
    ))
}
