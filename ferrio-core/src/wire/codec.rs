//! Framed codec with an embedded stream mode.
//!
//! The decoder is a two-state machine per connection. In frame mode it
//! accumulates bytes until a complete header + token + data tuple is
//! available and never consumes a partial frame. When a decoded frame
//! carries a non-zero stream length, the decoder switches to stream mode and
//! hands incoming bytes through as opaque chunks until the residual counter
//! reaches zero; the chunks are never buffered into a whole.

use super::{Command, Packet, FIXED_HEADER_LEN, MAGIC, MAX_DATA_LEN};
use crate::error::FerrioError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// One decoder output: either a control frame or a piece of the stream
/// payload that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Packet(Packet),
    StreamChunk(Bytes),
}

#[derive(Debug, Default)]
pub struct FrameCodec {
    stream_remaining: u64,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while stream payload bytes are still owed on this connection.
    pub fn in_stream(&self) -> bool {
        self.stream_remaining > 0
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FerrioError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FerrioError> {
        if self.stream_remaining > 0 {
            if src.is_empty() {
                return Ok(None);
            }
            let take = (src.len() as u64).min(self.stream_remaining) as usize;
            let chunk = src.split_to(take).freeze();
            self.stream_remaining -= take as u64;
            return Ok(Some(Frame::StreamChunk(chunk)));
        }

        if src.len() < FIXED_HEADER_LEN {
            return Ok(None);
        }

        // Peek through a cursor; src is only advanced once the whole frame
        // is present.
        let mut peek = &src[..];
        let magic = peek.get_u32();
        if magic != MAGIC {
            return Err(FerrioError::Protocol(format!(
                "bad magic 0x{:08X}",
                magic
            )));
        }
        let version = peek.get_u8();
        let command = Command::from_byte(peek.get_u8());

        let token_len = peek.get_u32() as usize;
        if token_len > MAX_DATA_LEN {
            return Err(FerrioError::FrameTooLarge(token_len));
        }
        if peek.remaining() < token_len + 4 {
            return Ok(None);
        }
        let token = if token_len == 0 {
            None
        } else {
            let raw = peek[..token_len].to_vec();
            peek.advance(token_len);
            Some(String::from_utf8(raw).map_err(|error| {
                FerrioError::Protocol(format!("non-UTF-8 token: {}", error))
            })?)
        };

        let data_len = peek.get_u32() as usize;
        if data_len > MAX_DATA_LEN {
            return Err(FerrioError::FrameTooLarge(data_len));
        }
        if peek.remaining() < data_len + 8 {
            return Ok(None);
        }
        let data = Bytes::copy_from_slice(&peek[..data_len]);
        peek.advance(data_len);
        let stream_len = peek.get_u64();

        src.advance(FIXED_HEADER_LEN + token_len + data_len);
        self.stream_remaining = stream_len;

        Ok(Some(Frame::Packet(Packet {
            version,
            command,
            token,
            data,
            stream_len,
        })))
    }
}

impl Encoder<Packet> for FrameCodec {
    type Error = FerrioError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), FerrioError> {
        use bytes::BufMut;

        let token = packet.token.as_deref().unwrap_or("");
        if packet.token.is_some() && token.is_empty() {
            return Err(FerrioError::Protocol("empty token is not allowed".into()));
        }
        if packet.data.len() > MAX_DATA_LEN {
            return Err(FerrioError::FrameTooLarge(packet.data.len()));
        }

        dst.reserve(FIXED_HEADER_LEN + token.len() + packet.data.len());
        dst.put_u32(MAGIC);
        dst.put_u8(packet.version);
        dst.put_u8(packet.command.as_byte());
        dst.put_u32(token.len() as u32);
        dst.put_slice(token.as_bytes());
        dst.put_u32(packet.data.len() as u32);
        dst.put_slice(&packet.data);
        dst.put_u64(packet.stream_len);
        Ok(())
    }
}

/// Raw stream payload passthrough, used after a frame announcing a stream.
impl Encoder<Bytes> for FrameCodec {
    type Error = FerrioError;

    fn encode(&mut self, chunk: Bytes, dst: &mut BytesMut) -> Result<(), FerrioError> {
        dst.extend_from_slice(&chunk);
        Ok(())
    }
}
