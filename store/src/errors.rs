use cid::Cid;
use thiserror::Error;

use stargate_castore::DecodeError;

#[derive(Debug, Error)]
pub enum Error {
    /// No root or block by that CID.
    #[error("unable to find CID: {0}")]
    NotFound(Cid),

    /// Path traversal failed at `cid`, `path` deep into the request.
    #[error("path traversal error at {cid}/{path}: {cause}")]
    Path {
        cid: Cid,
        path: String,
        cause: String,
    },

    /// A query resolver was pulled past its last message.
    #[error("query resolution already complete")]
    NoMoreMessages,

    /// Malformed URL, CID or query parameter.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("internal storage error: {0}")]
    Storage(String),
}

impl From<stargate_castore::Error> for Error {
    fn from(value: stargate_castore::Error) -> Self {
        match value {
            stargate_castore::Error::NotFound(cid) => Error::NotFound(cid),
            stargate_castore::Error::InvalidRequest(msg) => Error::InvalidRequest(msg),
            stargate_castore::Error::StorageError(msg) => Error::Storage(msg),
            stargate_castore::Error::Decode(e) => Error::Decode(e),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Error::Storage(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Storage(value.to_string())
    }
}
