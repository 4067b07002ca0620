//! Client side of the wire protocol.
//!
//! One connection carries one request at a time; replies are matched by
//! position, so no correlation ids exist anywhere in the protocol.

use crate::error::{FerrioError, Result};
use crate::net;
use crate::node::DataNodeEntry;
use crate::wire::codec::{Frame, FrameCodec};
use crate::wire::{Command, Packet};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

const STREAM_CHUNK: usize = 64 * 1024;

pub struct Connection {
    framed: Framed<TcpStream, FrameCodec>,
    token: String,
}

impl Connection {
    pub async fn connect(addr: &str, token: impl Into<String>) -> Result<Self> {
        let stream = net::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, FrameCodec::new()),
            token: token.into(),
        })
    }

    fn packet(&self, command: Command, data: impl Into<Bytes>) -> Packet {
        Packet::new(command, data).with_token(self.token.clone())
    }

    /// Send a frame without waiting for a reply (heartbeats).
    pub async fn send_only(&mut self, command: Command, data: impl Into<Bytes>) -> Result<()> {
        let packet = self.packet(command, data);
        self.framed.send(packet).await?;
        Ok(())
    }

    /// Send a frame and wait for the positional reply.
    pub async fn request(&mut self, command: Command, data: impl Into<Bytes>) -> Result<Packet> {
        let packet = self.packet(command, data);
        self.framed.send(packet).await?;
        self.next_packet().await
    }

    async fn next_packet(&mut self) -> Result<Packet> {
        match self.framed.next().await {
            Some(Ok(Frame::Packet(packet))) => Ok(packet),
            Some(Ok(Frame::StreamChunk(_))) => Err(FerrioError::Protocol(
                "unexpected stream payload while waiting for a frame".to_string(),
            )),
            Some(Err(error)) => Err(error),
            None => Err(FerrioError::Protocol(
                "connection closed while waiting for a reply".to_string(),
            )),
        }
    }

    fn fail_on_error(packet: Packet) -> Result<Packet> {
        if packet.command == Command::Error {
            let reason = packet.data_utf8().unwrap_or("unreadable error").to_string();
            return Err(FerrioError::Remote(reason));
        }
        Ok(packet)
    }

    /// Stream `size` bytes from `reader` to a data service under `hash` and
    /// return its final response.
    pub async fn upload<R>(&mut self, hash: &str, size: u64, reader: &mut R) -> Result<Packet>
    where
        R: AsyncRead + Unpin,
    {
        let request = self
            .packet(Command::UploadRequest, Bytes::from(hash.to_string()))
            .with_stream_len(size);
        self.framed.send(request).await?;

        let mut limited = reader.take(size);
        let mut sent = 0u64;
        let mut buf = BytesMut::with_capacity(STREAM_CHUNK);
        while sent < size {
            buf.clear();
            let read = limited.read_buf(&mut buf).await?;
            if read == 0 {
                return Err(FerrioError::Protocol(format!(
                    "upload source ended {} bytes early",
                    size - sent
                )));
            }
            sent += read as u64;
            self.framed.feed(buf.split().freeze()).await?;
        }
        SinkExt::<Bytes>::flush(&mut self.framed).await?;

        Self::fail_on_error(self.next_packet().await?)
    }

    /// Fetch the blob for `hash`, writing its bytes to `writer`. Returns the
    /// size announced by the data service.
    pub async fn download<W>(&mut self, hash: &str, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let header = self
            .request(Command::DownloadRequest, Bytes::from(hash.to_string()))
            .await
            .and_then(Self::fail_on_error)?;
        if header.command != Command::DownloadResponse {
            return Err(FerrioError::Protocol(format!(
                "unexpected download reply: {:?}",
                header.command
            )));
        }

        let mut remaining = header.stream_len;
        while remaining > 0 {
            match self.framed.next().await {
                Some(Ok(Frame::StreamChunk(chunk))) => {
                    remaining = remaining.saturating_sub(chunk.len() as u64);
                    writer.write_all(&chunk).await?;
                }
                Some(Ok(Frame::Packet(_))) => {
                    return Err(FerrioError::Protocol(
                        "frame arrived before the stream completed".to_string(),
                    ))
                }
                Some(Err(error)) => return Err(error),
                None => {
                    return Err(FerrioError::Protocol(format!(
                        "connection closed {} bytes before end of stream",
                        remaining
                    )))
                }
            }
        }
        writer.flush().await?;
        Ok(header.stream_len)
    }

    /// Registry pull: the active data-service member list.
    pub async fn fetch_data_nodes(&mut self) -> Result<Vec<DataNodeEntry>> {
        let reply = self
            .request(Command::RegistryGetDataNodes, Bytes::new())
            .await
            .and_then(Self::fail_on_error)?;
        if reply.command != Command::RegistryResponseDataNodes {
            return Err(FerrioError::Protocol(format!(
                "unexpected member-list reply: {:?}",
                reply.command
            )));
        }
        Ok(DataNodeEntry::parse_list(reply.data_utf8()?))
    }
}
