use cid::Cid;
use thiserror::Error;

/// Errors related to reading and writing block stores.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to find CID: {0}")]
    NotFound(Cid),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal storage error: {0}")]
    StorageError(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::InvalidInput {
            Error::InvalidRequest(value.to_string())
        } else {
            Error::StorageError(value.to_string())
        }
    }
}

/// Errors that occur while decoding dag-pb blocks and the UnixFS
/// structures they carry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected protobuf dag node")]
    NotProtobuf,

    /// The dag-pb data field is absent or not UnixFS-decodable.
    #[error("node is not a UnixFS node")]
    NotUnixFs,

    #[error("invalid data type: {0}")]
    InvalidDataType(i64),

    #[error("link has a missing or invalid hash")]
    InvalidLinkHash,

    #[error("missing link name")]
    MissingLinkName,

    /// A HAMT link name shorter than the shard's bucket prefix.
    #[error("invalid link name: {0:?}")]
    InvalidLinkName(String),

    #[error("missing fanout on HAMT shard")]
    MissingFanout,

    #[error("missing t-size on raw leaf link")]
    MissingTSize,

    #[error("missing block size for link {0}")]
    MissingBlockSize(usize),
}
