//! Root discovery: scan a block store's key set and return the CIDs
//! nothing else in the set links to.

use std::collections::HashSet;

use cid::Cid;
use futures::TryStreamExt;
use tracing::instrument;

use crate::blockservice::{self, BlockService};
use crate::cids::{DAG_PB_CODEC, RAW_CODEC};
use crate::proto::{classify_hamt_link, hamt_pad_length, LinkClass, NodeKind, PbNode, UnixfsData};
use crate::Error;

/// Scan all keys in `blocks` and return the UnixFS DAG roots among
/// them.
///
/// Child rules: a file's children are all of its links; a HAMT shard's
/// children are its internal shard pointers only (value entries begin
/// DAGs of their own); a basic directory's entries stay independently
/// reachable roots; raw blocks have no children. dag-pb blocks that do
/// not decode as UnixFS are ignored entirely, as are other codecs.
#[instrument(skip_all, err)]
pub async fn discover_roots(blocks: &dyn BlockService) -> Result<Vec<Cid>, Error> {
    let mut roots: HashSet<Cid> = HashSet::new();
    let mut non_roots: HashSet<Cid> = HashSet::new();

    let mut keys = blocks.keys();
    while let Some(next) = keys.try_next().await? {
        let mut children: Vec<Cid> = Vec::new();
        match next.codec() {
            DAG_PB_CODEC => {
                let data = blockservice::require(blocks, &next).await?;
                let node = PbNode::from_bytes(&data)
                    .map_err(|e| Error::StorageError(format!("malformed block {next}: {e}")))?;
                if node.data.is_none() {
                    continue;
                }
                let Ok(ufs) = UnixfsData::from_node(&node) else {
                    continue;
                };
                match ufs.kind() {
                    Ok(NodeKind::File) => {
                        for link in &node.links {
                            children.push(link.cid()?);
                        }
                    }
                    Ok(NodeKind::HamtShard) => {
                        let pad_length = hamt_pad_length(&ufs)?;
                        for link in &node.links {
                            if classify_hamt_link(link, pad_length)? == LinkClass::ShardPointer {
                                children.push(link.cid()?);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(_) => continue,
                }
            }
            RAW_CODEC => {}
            _ => continue,
        }

        for child in children {
            roots.remove(&child);
            non_roots.insert(child);
        }
        if !non_roots.contains(&next) {
            roots.insert(next);
        }
    }

    Ok(roots.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockservice::MemoryBlockService;
    use crate::fixtures::*;

    async fn sorted_roots(store: &MemoryBlockService) -> Vec<Cid> {
        let mut roots = discover_roots(store).await.unwrap();
        roots.sort();
        roots
    }

    fn sorted(mut cids: Vec<Cid>) -> Vec<Cid> {
        cids.sort();
        cids
    }

    #[tokio::test]
    async fn file_chunks_are_not_roots() {
        let (store, file) = chunked_file_fixture(3, 16);
        assert_eq!(sorted_roots(&store).await, vec![file.root]);
    }

    #[tokio::test]
    async fn directory_entries_remain_roots() {
        let (store, tree) = nested_tree_fixture();
        // the directory tree, the subfolder and the file are all
        // serveable on their own; only file chunks collapse
        assert_eq!(
            sorted_roots(&store).await,
            sorted(vec![tree.root, tree.subfolder, tree.file.root])
        );
    }

    #[tokio::test]
    async fn hamt_internal_shards_are_not_roots() {
        let (store, hamt) = hamt_fixture();
        assert_eq!(
            sorted_roots(&store).await,
            sorted(vec![hamt.root, hamt.top_value, hamt.nested_value])
        );
    }

    #[tokio::test]
    async fn lone_raw_block_is_a_root() {
        let (store, cid) = raw_block_fixture(b"loose bytes");
        assert_eq!(sorted_roots(&store).await, vec![cid]);
    }

    #[tokio::test]
    async fn non_unixfs_pb_node_is_ignored() {
        let (store, _bare) = bare_pb_node_fixture();
        assert!(sorted_roots(&store).await.is_empty());
    }

    #[tokio::test]
    async fn order_of_keys_does_not_matter() {
        // parent inserted before leaves and vice versa both collapse
        // the leaves into non-roots
        let (store, file) = chunked_file_fixture(2, 8);
        let mut blocks = store.blocks_in_order();
        blocks.reverse();
        let reversed = MemoryBlockService::default();
        for block in blocks {
            reversed.insert(block);
        }
        assert_eq!(sorted_roots(&reversed).await, vec![file.root]);
    }
}
