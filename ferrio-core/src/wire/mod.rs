//! Wire protocol shared by the registry, name and data services.
//!
//! A transmitted unit is a fixed header followed by a variable token, a
//! variable data region and an 8-byte stream length. When the stream length
//! is non-zero, exactly that many raw payload bytes follow on the same
//! connection before the next frame.

pub mod codec;

use crate::error::{FerrioError, Result};
use bytes::Bytes;

/// Frame preamble; a mismatch closes the connection without resync.
pub const MAGIC: u32 = 0xCAFE_BABE;

/// Current protocol version, carried in every frame.
pub const VERSION: u8 = 1;

/// Upper bound on the token and data regions of a control frame.
pub const MAX_DATA_LEN: usize = 4 * 1024 * 1024;

/// magic(4) + version(1) + command(1) + tokenLen(4) + dataLen(4) + streamLen(8)
pub(crate) const FIXED_HEADER_LEN: usize = 22;

/// Development bearer token, used when no `auth.token` is configured.
pub const DEFAULT_TOKEN: &str = "ferrio-secure-token-2026";

/// Commands understood by the three services. Unknown bytes decode to
/// [`Command::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    UploadRequest,
    UploadResponse,
    DownloadRequest,
    DownloadResponse,

    RequestUploadLoc,
    ResponseUploadLoc,
    CommitFile,
    ResponseCommit,
    RequestDownloadLoc,
    ResponseDownloadLoc,

    CheckExistence,
    ResponseExist,
    ResponseNotExist,

    PreUpload,
    ResponseAllow,
    ResponseWait,

    RegistryRegister,
    RegistryResponseRegister,
    RegistryHeartbeat,
    RegistryGetDataNodes,
    RegistryResponseDataNodes,

    RegistryRegisterNameNode,
    RegistryResponseRegisterNameNode,
    RegistryGetNameNodes,
    RegistryResponseNameNodes,
    RegistryHeartbeatNameNode,

    Error,
}

impl Command {
    pub fn as_byte(self) -> u8 {
        match self {
            Command::UploadRequest => 1,
            Command::UploadResponse => 2,
            Command::DownloadRequest => 3,
            Command::DownloadResponse => 4,
            Command::RequestUploadLoc => 10,
            Command::ResponseUploadLoc => 11,
            Command::CommitFile => 12,
            Command::ResponseCommit => 13,
            Command::RequestDownloadLoc => 14,
            Command::ResponseDownloadLoc => 15,
            Command::CheckExistence => 20,
            Command::ResponseExist => 21,
            Command::ResponseNotExist => 22,
            Command::PreUpload => 23,
            Command::ResponseAllow => 24,
            Command::ResponseWait => 25,
            Command::RegistryRegister => 30,
            Command::RegistryResponseRegister => 31,
            Command::RegistryHeartbeat => 32,
            Command::RegistryGetDataNodes => 33,
            Command::RegistryResponseDataNodes => 34,
            Command::RegistryRegisterNameNode => 35,
            Command::RegistryResponseRegisterNameNode => 36,
            Command::RegistryGetNameNodes => 37,
            Command::RegistryResponseNameNodes => 38,
            Command::RegistryHeartbeatNameNode => 39,
            // i8 -1 on the wire
            Command::Error => 0xFF,
        }
    }

    pub fn from_byte(value: u8) -> Command {
        match value {
            1 => Command::UploadRequest,
            2 => Command::UploadResponse,
            3 => Command::DownloadRequest,
            4 => Command::DownloadResponse,
            10 => Command::RequestUploadLoc,
            11 => Command::ResponseUploadLoc,
            12 => Command::CommitFile,
            13 => Command::ResponseCommit,
            14 => Command::RequestDownloadLoc,
            15 => Command::ResponseDownloadLoc,
            20 => Command::CheckExistence,
            21 => Command::ResponseExist,
            22 => Command::ResponseNotExist,
            23 => Command::PreUpload,
            24 => Command::ResponseAllow,
            25 => Command::ResponseWait,
            30 => Command::RegistryRegister,
            31 => Command::RegistryResponseRegister,
            32 => Command::RegistryHeartbeat,
            33 => Command::RegistryGetDataNodes,
            34 => Command::RegistryResponseDataNodes,
            35 => Command::RegistryRegisterNameNode,
            36 => Command::RegistryResponseRegisterNameNode,
            37 => Command::RegistryGetNameNodes,
            38 => Command::RegistryResponseNameNodes,
            39 => Command::RegistryHeartbeatNameNode,
            _ => Command::Error,
        }
    }
}

/// A decoded control frame. Stream payload bytes are delivered separately as
/// opaque chunks by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub command: Command,
    pub token: Option<String>,
    pub data: Bytes,
    pub stream_len: u64,
}

impl Packet {
    pub fn new(command: Command, data: impl Into<Bytes>) -> Self {
        Self {
            version: VERSION,
            command,
            token: None,
            data: data.into(),
            stream_len: 0,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_stream_len(mut self, stream_len: u64) -> Self {
        self.stream_len = stream_len;
        self
    }

    /// Data region as UTF-8, for the text-payload commands.
    pub fn data_utf8(&self) -> Result<&str> {
        std::str::from_utf8(&self.data)
            .map_err(|error| FerrioError::Protocol(format!("non-UTF-8 payload: {}", error)))
    }
}

pub fn compute_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
