use thiserror::Error;

pub type Result<T> = std::result::Result<T, FerrioError>;

#[derive(Error, Debug)]
pub enum FerrioError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("control frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("authentication failed")]
    Authentication,

    #[error("non-conformant hash: {0}")]
    InvalidHash(String),

    #[error("path escapes storage root: {0}")]
    PathEscape(String),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("no storage root available")]
    NoStorageRoot,

    #[error("no data service available")]
    NoDataNode,

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("internal error: {0}")]
    Internal(String),
}
