use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::stream::BoxStream;
use futures::StreamExt;

use super::{Block, BlockService, BlockSink};
use crate::Error;

/// An in-memory block store that remembers insertion order, used for
/// staging imports and in tests.
#[derive(Clone, Default)]
pub struct MemoryBlockService {
    db: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    order: Vec<Cid>,
    blocks: HashMap<Cid, Bytes>,
}

impl MemoryBlockService {
    /// Insert a block, keeping the first copy on duplicates. The sync
    /// twin of [BlockSink::put], used by fixture builders.
    pub fn insert(&self, block: Block) {
        let mut inner = self.db.write().expect("lock poisoned");
        if !inner.blocks.contains_key(&block.cid) {
            inner.order.push(block.cid);
            inner.blocks.insert(block.cid, block.data);
        }
    }

    /// All blocks, in the order they were first inserted.
    pub fn blocks_in_order(&self) -> Vec<Block> {
        let inner = self.db.read().expect("lock poisoned");
        inner
            .order
            .iter()
            .map(|cid| Block {
                cid: *cid,
                data: inner.blocks[cid].clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.db.read().expect("lock poisoned").order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlockService for MemoryBlockService {
    async fn has(&self, cid: &Cid) -> Result<bool, Error> {
        Ok(self.db.read().expect("lock poisoned").blocks.contains_key(cid))
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, Error> {
        Ok(self.db.read().expect("lock poisoned").blocks.get(cid).cloned())
    }

    fn keys(&self) -> BoxStream<'_, Result<Cid, Error>> {
        let order = self.db.read().expect("lock poisoned").order.clone();
        futures::stream::iter(order.into_iter().map(Ok)).boxed()
    }
}

#[async_trait]
impl BlockSink for MemoryBlockService {
    async fn put(&self, block: Block) -> Result<(), Error> {
        self.insert(block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cids::{cid_sha2_256, RAW_CODEC};
    use futures::TryStreamExt;

    #[tokio::test]
    async fn put_get_and_ordered_keys() {
        let store = MemoryBlockService::default();
        let a = Block {
            cid: cid_sha2_256(RAW_CODEC, b"a"),
            data: Bytes::from_static(b"a"),
        };
        let b = Block {
            cid: cid_sha2_256(RAW_CODEC, b"b"),
            data: Bytes::from_static(b"b"),
        };

        store.put(a.clone()).await.unwrap();
        store.put(b.clone()).await.unwrap();
        // duplicate put keeps the first copy and its position
        store.put(a.clone()).await.unwrap();

        assert!(store.has(&a.cid).await.unwrap());
        assert_eq!(store.get(&b.cid).await.unwrap(), Some(b.data.clone()));
        assert_eq!(
            store.get(&cid_sha2_256(RAW_CODEC, b"absent")).await.unwrap(),
            None
        );

        let keys: Vec<Cid> = store.keys().try_collect().await.unwrap();
        assert_eq!(keys, vec![a.cid, b.cid]);
    }
}
