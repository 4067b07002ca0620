//! Ferrio Core - shared building blocks for the ferrio content-addressed file store

pub mod blob_store;
pub mod client;
pub mod discovery;
pub mod error;
pub mod net;
pub mod node;
pub mod wire;

pub use blob_store::{BlobStore, IngestOutcome, TempUpload};
pub use client::Connection;
pub use error::{FerrioError, Result};
pub use node::DataNodeEntry;
pub use wire::codec::{Frame, FrameCodec};
pub use wire::{compute_hash, Command, Packet, DEFAULT_TOKEN, MAGIC, MAX_DATA_LEN, VERSION};
