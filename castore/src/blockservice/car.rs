use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::instrument;

use super::{Block, BlockService};
use crate::carv1::{self, CarHeader, MAX_SECTION_SIZE};
use crate::Error;

/// A read-only block store over a CAR v1 file.
///
/// Opening scans the file once and builds a CID → byte-range index;
/// `get` is then a positioned read. Concurrent readers each open their
/// own instance; reads on one instance are serialised on the file
/// handle.
pub struct CarBlockService {
    header: CarHeader,
    order: Vec<Cid>,
    index: HashMap<Cid, (u64, u64)>,
    file: Mutex<tokio::fs::File>,
}

impl CarBlockService {
    #[instrument(skip_all, fields(path = %path.as_ref().display()), err)]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let scan_path = path.clone();
        let (header, order, index) = tokio::task::spawn_blocking(move || scan(&scan_path))
            .await
            .map_err(|e| Error::StorageError(format!("car scan task failed: {e}")))??;
        let file = tokio::fs::File::open(&path).await?;
        Ok(Self {
            header,
            order,
            index,
            file: Mutex::new(file),
        })
    }

    /// The roots declared in the CAR header.
    pub fn roots(&self) -> &[Cid] {
        &self.header.roots
    }
}

#[async_trait]
impl BlockService for CarBlockService {
    async fn has(&self, cid: &Cid) -> Result<bool, Error> {
        Ok(self.index.contains_key(cid))
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, Error> {
        let Some(&(offset, len)) = self.index.get(cid) else {
            return Ok(None);
        };
        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).await?;
        Ok(Some(buf.into()))
    }

    fn keys(&self) -> BoxStream<'_, Result<Cid, Error>> {
        futures::stream::iter(self.order.iter().copied().map(Ok)).boxed()
    }
}

/// One pass over the file: decode the header, record every block's
/// payload offset and length, skip the payload bytes themselves.
fn scan(path: &Path) -> Result<(CarHeader, Vec<Cid>, HashMap<Cid, (u64, u64)>), Error> {
    let file = std::fs::File::open(path)?;
    let mut r = std::io::BufReader::new(file);
    let mut pos: u64 = 0;

    let header_len = carv1::read_uvarint_sync(&mut r, &mut pos)?
        .ok_or_else(|| Error::StorageError("car file is empty".into()))?;
    if header_len == 0 || header_len > MAX_SECTION_SIZE {
        return Err(Error::StorageError(format!(
            "invalid car header length {header_len}"
        )));
    }
    let mut raw = vec![0u8; header_len as usize];
    r.read_exact(&mut raw)?;
    pos += header_len;
    let header: CarHeader = serde_ipld_dagcbor::from_slice(&raw)
        .map_err(|e| Error::StorageError(format!("decoding car header: {e}")))?;

    let mut order = Vec::new();
    let mut index = HashMap::new();
    while let Some(len) = carv1::read_uvarint_sync(&mut r, &mut pos)? {
        if len == 0 || len > MAX_SECTION_SIZE {
            return Err(Error::StorageError(format!("invalid car record length {len}")));
        }
        let cid = Cid::read_bytes(&mut r)
            .map_err(|e| Error::StorageError(format!("invalid cid in car record: {e}")))?;
        let cid_len = cid.encoded_len() as u64;
        pos += cid_len;
        let data_len = len
            .checked_sub(cid_len)
            .ok_or_else(|| Error::StorageError("car record shorter than its cid".into()))?;
        if !index.contains_key(&cid) {
            order.push(cid);
            index.insert(cid, (pos, data_len));
        }
        r.seek_relative(data_len as i64)?;
        pos += data_len;
    }
    Ok((header, order, index))
}

/// Writes a CAR v1 file during import. Exclusive: one writer, no
/// readers until finished.
pub struct CarFileWriter<W> {
    w: W,
}

impl<W: AsyncWrite + Unpin + Send> CarFileWriter<W> {
    /// Write the header for the given roots and return the writer.
    pub async fn open(mut w: W, roots: Vec<Cid>) -> Result<Self, Error> {
        carv1::write_header(&mut w, &CarHeader::new(roots)).await?;
        Ok(Self { w })
    }

    pub async fn put(&mut self, block: &Block) -> Result<(), Error> {
        carv1::write_block(&mut self.w, &block.cid, &block.data).await
    }

    /// Flush and hand the underlying writer back.
    pub async fn finish(mut self) -> Result<W, Error> {
        self.w.flush().await?;
        Ok(self.w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cids::{cid_sha2_256, RAW_CODEC};
    use futures::TryStreamExt;

    fn raw_block(data: &'static [u8]) -> Block {
        Block {
            cid: cid_sha2_256(RAW_CODEC, data),
            data: Bytes::from_static(data),
        }
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let blocks = vec![raw_block(b"one"), raw_block(b"two"), raw_block(b"three")];
        let root = blocks[0].cid;

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = tokio::fs::File::from_std(tmp.reopen().unwrap());
        let mut writer = CarFileWriter::open(file, vec![root]).await.unwrap();
        for block in &blocks {
            writer.put(block).await.unwrap();
        }
        // writing the same block again must not duplicate the index entry
        writer.put(&blocks[0]).await.unwrap();
        writer.finish().await.unwrap();

        let store = CarBlockService::open(tmp.path()).await.unwrap();
        assert_eq!(store.roots(), &[root]);

        for block in &blocks {
            assert!(store.has(&block.cid).await.unwrap());
            assert_eq!(store.get(&block.cid).await.unwrap(), Some(block.data.clone()));
        }
        assert_eq!(
            store.get(&cid_sha2_256(RAW_CODEC, b"absent")).await.unwrap(),
            None
        );

        let keys: Vec<Cid> = store.keys().try_collect().await.unwrap();
        assert_eq!(keys, blocks.iter().map(|b| b.cid).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn open_rejects_empty_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        assert!(CarBlockService::open(tmp.path()).await.is_err());
    }
}
