use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::stream::BoxStream;

use crate::Error;

mod car;
mod memory;

pub use car::{CarBlockService, CarFileWriter};
pub use memory::MemoryBlockService;

/// A single content-addressed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub cid: Cid,
    pub data: Bytes,
}

impl std::fmt::Debug for dyn BlockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn BlockService")
    }
}

/// The base trait all block stores implement.
///
/// Reads are trusted: block bytes are assumed to match their CID. The
/// store is the trust boundary of the serving process.
#[async_trait]
pub trait BlockService: Send + Sync {
    /// Check whether the store holds a block, by CID.
    async fn has(&self, cid: &Cid) -> Result<bool, Error>;

    /// Fetch a block's bytes by CID, or `None` if absent.
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, Error>;

    /// All keys in the store, as a lazy stream.
    fn keys(&self) -> BoxStream<'_, Result<Cid, Error>>;
}

/// Write side used while staging imports.
#[async_trait]
pub trait BlockSink: Send + Sync {
    async fn put(&self, block: Block) -> Result<(), Error>;
}

/// Load a block, failing with [Error::NotFound] when absent.
pub async fn require(blocks: &dyn BlockService, cid: &Cid) -> Result<Bytes, Error> {
    blocks.get(cid).await?.ok_or(Error::NotFound(*cid))
}
