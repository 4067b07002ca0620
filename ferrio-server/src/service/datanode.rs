//! The data service: blob ingest and egress over the wire.
//!
//! Each connection owns its upload state. An `UPLOAD_REQUEST` opens a unique
//! temp file; subsequent stream chunks land in it sequentially and the
//! store's check-and-rename runs once the announced size has arrived. A
//! disconnect before that point deletes the temp file.

use super::{check_token, reject_unknown, send_error, send_reply, Wire};
use crate::config::DatanodeConfig;
use bytes::Bytes;
use ferrio_core::blob_store::GC_MAX_AGE;
use ferrio_core::{
    discovery, BlobStore, Command, FerrioError, Frame, FrameCodec, IngestOutcome, Packet, Result,
    TempUpload,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

const GC_INTERVAL: Duration = Duration::from_secs(60 * 60);
const STREAM_CHUNK: usize = 64 * 1024;

pub struct DatanodeService {
    token: String,
    store: Arc<BlobStore>,
}

impl DatanodeService {
    pub fn new(token: String, store: Arc<BlobStore>) -> Arc<Self> {
        Arc::new(Self { token, store })
    }

    pub fn store(&self) -> &Arc<BlobStore> {
        &self.store
    }

    async fn start_upload(&self, wire: &mut Wire, packet: &Packet) -> Result<TempUpload> {
        let hash = packet.data_utf8()?;
        if packet.data.is_empty() {
            send_error(wire, "missing upload hash").await?;
            return Err(FerrioError::Protocol("upload without a hash".to_string()));
        }

        match self.store.begin_ingest(hash, packet.stream_len).await {
            Ok(upload) => {
                tracing::info!(
                    "receiving blob: hash={} size={}",
                    hash,
                    packet.stream_len
                );
                Ok(upload)
            }
            Err(error @ FerrioError::InvalidHash(_)) => {
                send_error(wire, "non-conformant hash").await?;
                Err(error)
            }
            Err(error) => {
                send_error(wire, &format!("storage error: {}", error)).await?;
                Err(error)
            }
        }
    }

    async fn finish_upload(&self, wire: &mut Wire, upload: TempUpload) -> Result<()> {
        let hash = upload.hash().to_string();
        match self.store.finish(upload).await {
            Ok(IngestOutcome::Stored) => {
                tracing::info!("blob stored: hash={}", hash);
                send_reply(
                    wire,
                    Command::UploadResponse,
                    format!("upload success: {}", hash),
                )
                .await
            }
            Ok(IngestOutcome::Deduplicated) => {
                tracing::info!("blob already present, temp discarded: hash={}", hash);
                send_reply(
                    wire,
                    Command::UploadResponse,
                    format!("upload success (dedup): {}", hash),
                )
                .await
            }
            Err(error) => {
                tracing::error!("finishing blob {} failed: {}", hash, error);
                send_error(wire, &format!("storage error: {}", error)).await?;
                Err(error)
            }
        }
    }

    async fn handle_download(&self, wire: &mut Wire, packet: &Packet) -> Result<()> {
        let hash = packet.data_utf8()?;
        let path = match self.store.locate(hash) {
            Ok(Some(path)) => path,
            Ok(None) => {
                let missing = FerrioError::BlobNotFound(hash.to_string());
                return send_error(wire, &missing.to_string()).await;
            }
            Err(error @ FerrioError::InvalidHash(_)) => {
                send_error(wire, "non-conformant hash").await?;
                return Err(error);
            }
            Err(error) => {
                send_error(wire, &format!("storage error: {}", error)).await?;
                return Err(error);
            }
        };

        let mut file = tokio::fs::File::open(&path).await?;
        let size = file.metadata().await?.len();
        tracing::info!("sending blob: hash={} size={}", hash, size);

        let header = Packet::new(Command::DownloadResponse, size.to_string())
            .with_stream_len(size);
        wire.send(header).await?;

        let mut buf = bytes::BytesMut::with_capacity(STREAM_CHUNK);
        let mut remaining = size;
        while remaining > 0 {
            buf.clear();
            let read = file.read_buf(&mut buf).await?;
            if read == 0 {
                return Err(FerrioError::Internal(format!(
                    "blob {} truncated {} bytes before its recorded size",
                    hash, remaining
                )));
            }
            remaining = remaining.saturating_sub(read as u64);
            wire.feed(buf.split().freeze()).await?;
        }
        SinkExt::<Bytes>::flush(wire).await
    }

    pub async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        let mut wire = Framed::new(stream, FrameCodec::new());
        let mut upload: Option<TempUpload> = None;

        loop {
            let frame = match wire.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(error)) => {
                    tracing::debug!("data connection {:?} codec error: {}", peer, error);
                    break;
                }
                None => break,
            };

            let result = match frame {
                Frame::Packet(packet) => {
                    self.handle_packet(&mut wire, packet, &mut upload).await
                }
                Frame::StreamChunk(chunk) => {
                    self.handle_chunk(&mut wire, chunk, &mut upload).await
                }
            };

            if let Err(error) = result {
                tracing::debug!("data connection {:?} closed: {}", peer, error);
                break;
            }
        }

        // Disconnect (or teardown) with an unfinished upload: drop the temp.
        if let Some(mut pending) = upload {
            tracing::info!(
                "connection ended mid-upload at {} of {} bytes, removing temp",
                pending.received(),
                pending.expected()
            );
            pending.abort().await;
        }
    }

    async fn handle_packet(
        &self,
        wire: &mut Wire,
        packet: Packet,
        upload: &mut Option<TempUpload>,
    ) -> Result<()> {
        check_token(wire, &self.token, &packet).await?;

        match packet.command {
            Command::UploadRequest => {
                if let Some(mut stale) = upload.take() {
                    stale.abort().await;
                }
                let started = self.start_upload(wire, &packet).await?;
                if started.is_complete() {
                    // Zero-length blob: nothing follows the header.
                    self.finish_upload(wire, started).await
                } else {
                    *upload = Some(started);
                    Ok(())
                }
            }
            Command::DownloadRequest => self.handle_download(wire, &packet).await,
            _ => reject_unknown(wire, &packet).await,
        }
    }

    async fn handle_chunk(
        &self,
        wire: &mut Wire,
        chunk: Bytes,
        upload: &mut Option<TempUpload>,
    ) -> Result<()> {
        let Some(current) = upload.as_mut() else {
            // Stream bytes with no ingest in progress: nothing to write to.
            return Ok(());
        };

        if let Err(error) = current.write_chunk(&chunk).await {
            if let Some(mut failed) = upload.take() {
                failed.abort().await;
            }
            send_error(wire, &format!("write error: {}", error)).await?;
            return Err(error);
        }

        if current.is_complete() {
            let finished = upload.take().expect("upload checked above");
            self.finish_upload(wire, finished).await?;
        }
        Ok(())
    }

    pub fn spawn_gc(self: &Arc<Self>) -> JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GC_INTERVAL);
            // The first tick fires immediately; skip it so a restart does
            // not race connections that are just starting their uploads.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.gc_once(GC_MAX_AGE).await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!("gc removed {} stale temp files", removed);
                    }
                    Ok(_) => {}
                    Err(error) => tracing::warn!("gc pass failed: {}", error),
                }
            }
        })
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, _) = listener.accept().await?;
            stream.set_nodelay(true)?;
            tokio::spawn(self.clone().handle_connection(stream));
        }
    }
}

/// Entry point for `ferrio datanode`.
pub async fn run(cfg: DatanodeConfig) -> Result<()> {
    let store = Arc::new(BlobStore::open(cfg.storage.paths.clone())?);
    tracing::info!("storage roots: {:?}", store.roots());

    let registries = cfg.registry.addresses.resolve()?;
    let advertised = cfg.advertised_addr();
    tracing::info!(
        "data service advertising {} to registries {:?}",
        advertised,
        registries
    );

    let push_store = store.clone();
    discovery::spawn_datanode_push(registries, cfg.auth.token.clone(), advertised, move || {
        push_store.total_free_space()
    });

    let service = DatanodeService::new(cfg.auth.token.clone(), store);
    service.spawn_gc();

    let bind = format!("0.0.0.0:{}", cfg.server.port);
    let listener = TcpListener::bind(&bind).await?;
    tracing::info!("data service listening on {}", bind);
    service.serve(listener).await
}
