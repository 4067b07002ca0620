//! The name service: admission, commit and location lookups over the wire.
//!
//! Pure dispatch — every hard decision lives in the admission controller.
//! The service owns the data-node snapshot kept fresh by the discovery pull
//! task and picks upload targets by weighted random over free space.

use super::{check_token, reject_unknown, send_error, send_reply, Wire};
use crate::config::{MetadataMode, NamenodeConfig};
use ferrio_core::discovery::{self, DataNodeSnapshot};
use ferrio_core::{Command, DataNodeEntry, FerrioError, Frame, FrameCodec, Packet, Result};
use ferrio_meta::{AdmissionController, AdmissionDecision, MetaError, MetaStore, MetadataBackend};
use futures::StreamExt;
use rand::Rng;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::codec::Framed;

pub struct NamenodeService {
    token: String,
    admission: Arc<AdmissionController>,
    data_nodes: DataNodeSnapshot,
}

/// Weighted random over free space; uniform when every weight is zero.
fn select_location(nodes: &[DataNodeEntry]) -> Option<String> {
    if nodes.is_empty() {
        return None;
    }

    let total: i64 = nodes
        .iter()
        .map(|node| node.free_space.max(0))
        .fold(0i64, |acc, weight| acc.saturating_add(weight));

    let mut rng = rand::thread_rng();
    if total <= 0 {
        let index = rng.gen_range(0..nodes.len());
        return Some(nodes[index].address.clone());
    }

    let mut remaining = rng.gen_range(0..total);
    for node in nodes {
        let weight = node.free_space.max(0);
        if remaining < weight {
            return Some(node.address.clone());
        }
        remaining -= weight;
    }

    nodes.last().map(|node| node.address.clone())
}

fn persist_error_text(error: &MetaError) -> String {
    match error {
        MetaError::Persistence(_) => "Metadata Persistence Failed".to_string(),
        other => format!("commit failed: {}", other),
    }
}

impl NamenodeService {
    pub fn new(
        token: String,
        admission: Arc<AdmissionController>,
        data_nodes: DataNodeSnapshot,
    ) -> Arc<Self> {
        Arc::new(Self {
            token,
            admission,
            data_nodes,
        })
    }

    pub fn snapshot(&self) -> DataNodeSnapshot {
        self.data_nodes.clone()
    }

    async fn handle_packet(&self, wire: &mut Wire, packet: Packet) -> Result<()> {
        check_token(wire, &self.token, &packet).await?;

        match packet.command {
            Command::PreUpload => {
                let hash = packet.data_utf8()?;
                match self.admission.pre_upload(hash).await {
                    Ok(AdmissionDecision::Exists(record)) => {
                        send_reply(wire, Command::ResponseExist, record.location).await
                    }
                    Ok(AdmissionDecision::Allow) => {
                        send_reply(wire, Command::ResponseAllow, "OK").await
                    }
                    Ok(AdmissionDecision::Wait) => {
                        send_reply(wire, Command::ResponseWait, "Waiting").await
                    }
                    Err(error) => {
                        tracing::error!("pre-upload failed for {}: {}", hash, error);
                        send_error(wire, &error.to_string()).await
                    }
                }
            }
            Command::CheckExistence => {
                let hash = packet.data_utf8()?;
                match self.admission.check_existence(hash).await {
                    Ok(Some(record)) => {
                        tracing::info!("instant upload hit: hash={}", hash);
                        send_reply(wire, Command::ResponseExist, record.location).await
                    }
                    Ok(None) => send_reply(wire, Command::ResponseNotExist, "Not Found").await,
                    Err(error) => send_error(wire, &error.to_string()).await,
                }
            }
            Command::RequestUploadLoc => {
                let nodes = self.data_nodes.read().await.clone();
                match select_location(&nodes) {
                    Some(address) => {
                        send_reply(wire, Command::ResponseUploadLoc, address).await
                    }
                    None => send_error(wire, &FerrioError::NoDataNode.to_string()).await,
                }
            }
            Command::CommitFile => {
                let payload = packet.data_utf8()?;
                let mut parts = payload.split('|');
                let (filename, hash, location) =
                    match (parts.next(), parts.next(), parts.next(), parts.next()) {
                        (Some(filename), Some(hash), Some(location), None) => {
                            (filename, hash, location)
                        }
                        _ => {
                            return send_error(wire, "malformed commit payload").await;
                        }
                    };

                match self.admission.commit(filename, hash, location).await {
                    Ok(outcome) => {
                        send_reply(wire, Command::ResponseCommit, outcome.storage_id).await
                    }
                    Err(error) => {
                        tracing::error!("commit failed for {}: {}", filename, error);
                        send_error(wire, &persist_error_text(&error)).await
                    }
                }
            }
            Command::RequestDownloadLoc => {
                let id = packet.data_utf8()?;
                match self.admission.resolve_download(id).await {
                    Ok(Some(record)) => {
                        let reply =
                            format!("{}|{}|{}", record.filename, record.hash, record.location);
                        send_reply(wire, Command::ResponseDownloadLoc, reply).await
                    }
                    Ok(None) => send_error(wire, "file not found").await,
                    Err(error) => send_error(wire, &error.to_string()).await,
                }
            }
            _ => reject_unknown(wire, &packet).await,
        }
    }

    pub async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        let mut wire = Framed::new(stream, FrameCodec::new());

        while let Some(frame) = wire.next().await {
            let result = match frame {
                Ok(Frame::Packet(packet)) => self.handle_packet(&mut wire, packet).await,
                Ok(Frame::StreamChunk(_)) => break,
                Err(error) => Err(error),
            };

            if let Err(error) = result {
                tracing::debug!("name connection {:?} closed: {}", peer, error);
                break;
            }
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, _) = listener.accept().await?;
            stream.set_nodelay(true)?;
            tokio::spawn(self.clone().handle_connection(stream));
        }
    }
}

/// Entry point for `ferrio namenode`.
pub async fn run(cfg: NamenodeConfig) -> Result<()> {
    let cache = cfg.metadata.cache.to_cache_config()?;

    let backend: Arc<dyn MetadataBackend> = match cfg.metadata.mode {
        MetadataMode::File => {
            tracing::info!(
                "using file metadata backend at {}",
                cfg.metadata.file.path.display()
            );
            Arc::new(
                ferrio_meta::FileLogBackend::open(cfg.metadata.file.path.clone())
                    .map_err(|e| FerrioError::Config(e.to_string()))?,
            )
        }
        MetadataMode::Sqlite => {
            tracing::info!(
                "using sqlite metadata backend at {}",
                cfg.metadata.sqlite.path.display()
            );
            Arc::new(
                ferrio_meta::SqliteBackend::open(cfg.metadata.sqlite.path.clone())
                    .map_err(|e| FerrioError::Config(e.to_string()))?,
            )
        }
    };

    let store = Arc::new(MetaStore::new(backend, cache));
    if cfg.metadata.mode == MetadataMode::File {
        match store.preload().await {
            Ok(count) => tracing::info!("warmed metadata cache with {} records", count),
            Err(error) => tracing::warn!("metadata cache warm-up failed: {}", error),
        }
    } else {
        tracing::info!("sqlite metadata backend: lazy cache fills, no warm-up");
    }

    let admission = Arc::new(AdmissionController::new(store));
    admission.spawn_pending_sweeper();

    let registries = cfg.registry.addresses.resolve()?;
    let advertised = cfg.advertised_addr();
    tracing::info!(
        "name service advertising {} to registries {:?}",
        advertised,
        registries
    );

    let snapshot: DataNodeSnapshot = Arc::new(RwLock::new(Vec::new()));
    discovery::spawn_namenode_push(registries.clone(), cfg.auth.token.clone(), advertised);
    discovery::spawn_datanode_pull(registries, cfg.auth.token.clone(), snapshot.clone());

    let service = NamenodeService::new(cfg.auth.token.clone(), admission, snapshot);

    let bind = format!("0.0.0.0:{}", cfg.server.port);
    let listener = TcpListener::bind(&bind).await?;
    tracing::info!("name service listening on {}", bind);
    service.serve(listener).await
}
