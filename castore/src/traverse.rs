//! UnixFS DAG traversal.
//!
//! Walks a DAG rooted at a CID and reports what it finds to a
//! [UnixFsVisitor]: the root's kind, every directory entry together
//! with the block chain that proves its resolution, and every block of
//! a file together with the byte range it contributes.

use async_trait::async_trait;
use cid::Cid;
use futures::future::BoxFuture;
use tracing::instrument;

use crate::blockservice::{self, BlockService};
use crate::cids::RAW_CODEC;
use crate::proto::{classify_hamt_link, hamt_pad_length, LinkClass, NodeKind, PbNode, UnixfsData};
use crate::{DecodeError, Error};

/// Hooks invoked as a UnixFS DAG is walked. A visitor error aborts the
/// traversal and is surfaced to the caller.
#[async_trait]
pub trait UnixFsVisitor: Send + Sync {
    /// Called once per DAG entered, with the root's UnixFS kind.
    async fn on_root(&self, root: Cid, kind: NodeKind) -> Result<(), Error>;

    /// Called for each directory entry. `chain` is the ordered list of
    /// blocks needed to verify that `label` resolves from `root`:
    /// length 1 for a basic directory, 1 + the shards traversed for a
    /// HAMT.
    async fn on_path(&self, root: Cid, label: &str, chain: &[Cid]) -> Result<(), Error>;

    /// Called for every block of a file root, children before parents
    /// within a subtree. `[byte_min, byte_max)` is the span of the
    /// reconstructed file the block contributes.
    async fn on_file_range(
        &self,
        root: Cid,
        cid: Cid,
        depth: u64,
        byte_min: u64,
        byte_max: u64,
        leaf: bool,
    ) -> Result<(), Error>;
}

/// Walk the DAG rooted at `root`, dispatching on its UnixFS kind.
#[instrument(skip(blocks, visitor), err)]
pub async fn iterate_node(
    blocks: &dyn BlockService,
    root: Cid,
    visitor: &dyn UnixFsVisitor,
) -> Result<(), Error> {
    // raw blocks are opaque leaves with no structure to walk
    if root.codec() == RAW_CODEC {
        return visitor.on_root(root, NodeKind::Raw).await;
    }
    let data = blockservice::require(blocks, &root).await?;
    let node = PbNode::from_bytes(&data)?;
    let ufs = UnixfsData::from_node(&node)?;
    let kind = ufs.kind()?;
    visitor.on_root(root, kind).await?;
    match kind {
        NodeKind::File => walk_file(blocks, root, node, ufs, 0, 0, visitor).await,
        NodeKind::Directory => walk_directory(root, &node, visitor).await,
        NodeKind::HamtShard => walk_hamt(blocks, root, node, ufs, Vec::new(), visitor).await,
        NodeKind::Raw | NodeKind::Symlink | NodeKind::Metadata => Ok(()),
    }
}

/// Wraps a visitor and, after forwarding each `on_path`, re-enters the
/// traversal at the chain's leaf, so an entire tree is visited from a
/// single root.
pub struct RecursiveVisitor<'a> {
    inner: &'a dyn UnixFsVisitor,
    blocks: &'a dyn BlockService,
}

impl<'a> RecursiveVisitor<'a> {
    pub fn new(inner: &'a dyn UnixFsVisitor, blocks: &'a dyn BlockService) -> Self {
        Self { inner, blocks }
    }
}

#[async_trait]
impl UnixFsVisitor for RecursiveVisitor<'_> {
    async fn on_root(&self, root: Cid, kind: NodeKind) -> Result<(), Error> {
        self.inner.on_root(root, kind).await
    }

    async fn on_path(&self, root: Cid, label: &str, chain: &[Cid]) -> Result<(), Error> {
        self.inner.on_path(root, label, chain).await?;
        let leaf = *chain.last().ok_or_else(|| {
            Error::StorageError("path resolution chain must not be empty".into())
        })?;
        iterate_node(self.blocks, leaf, self).await
    }

    async fn on_file_range(
        &self,
        root: Cid,
        cid: Cid,
        depth: u64,
        byte_min: u64,
        byte_max: u64,
        leaf: bool,
    ) -> Result<(), Error> {
        self.inner
            .on_file_range(root, cid, depth, byte_min, byte_max, leaf)
            .await
    }
}

/// Walk a file node's links, threading the byte offset through the
/// tree. Each child's range is reported after the child's own subtree,
/// so ranges arrive children-before-parents.
fn walk_file<'a>(
    blocks: &'a dyn BlockService,
    root: Cid,
    node: PbNode,
    ufs: UnixfsData,
    mut offset: u64,
    depth: u64,
    visitor: &'a dyn UnixFsVisitor,
) -> BoxFuture<'a, Result<(), Error>> {
    Box::pin(async move {
        for (idx, link) in node.links.iter().enumerate() {
            let child = link.cid()?;
            let size;
            let leaf;
            if child.codec() == RAW_CODEC {
                size = link.tsize.ok_or(DecodeError::MissingTSize)?;
                leaf = true;
            } else {
                size = *ufs
                    .blocksizes
                    .get(idx)
                    .ok_or(DecodeError::MissingBlockSize(idx))?;
                let data = blockservice::require(blocks, &child).await?;
                let child_node = PbNode::from_bytes(&data)?;
                let child_ufs = UnixfsData::from_node(&child_node)?;
                match child_ufs.kind()? {
                    NodeKind::Raw => leaf = true,
                    NodeKind::File => {
                        walk_file(blocks, root, child_node, child_ufs, offset, depth + 1, visitor)
                            .await?;
                        leaf = false;
                    }
                    other => return Err(DecodeError::InvalidDataType(other.as_i64()).into()),
                }
            }
            visitor
                .on_file_range(root, child, depth, offset, offset + size, leaf)
                .await?;
            offset += size;
        }
        Ok(())
    })
}

async fn walk_directory(
    root: Cid,
    node: &PbNode,
    visitor: &dyn UnixFsVisitor,
) -> Result<(), Error> {
    for link in &node.links {
        let name = link.name.as_deref().ok_or(DecodeError::MissingLinkName)?;
        visitor.on_path(root, name, &[link.cid()?]).await?;
    }
    Ok(())
}

/// Walk a HAMT shard. `chain` accumulates the shard CIDs visited so
/// far; value entries emit `chain ++ [value]` as their proof chain.
fn walk_hamt<'a>(
    blocks: &'a dyn BlockService,
    root: Cid,
    node: PbNode,
    ufs: UnixfsData,
    chain: Vec<Cid>,
    visitor: &'a dyn UnixFsVisitor,
) -> BoxFuture<'a, Result<(), Error>> {
    Box::pin(async move {
        let pad_length = hamt_pad_length(&ufs)?;
        for link in &node.links {
            let child = link.cid()?;
            match classify_hamt_link(link, pad_length)? {
                LinkClass::ValueEntry => {
                    let name = link.name.as_deref().unwrap_or_default();
                    let label = name
                        .get(pad_length..)
                        .ok_or_else(|| DecodeError::InvalidLinkName(name.to_string()))?;
                    let mut proof = chain.clone();
                    proof.push(child);
                    visitor.on_path(root, label, &proof).await?;
                }
                LinkClass::ShardPointer => {
                    let data = blockservice::require(blocks, &child).await?;
                    let child_node = PbNode::from_bytes(&data)?;
                    let child_ufs = UnixfsData::from_node(&child_node)?;
                    let mut child_chain = chain.clone();
                    child_chain.push(child);
                    walk_hamt(blocks, root, child_node, child_ufs, child_chain, visitor).await?;
                }
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;

    #[tokio::test]
    async fn flat_file_emits_contiguous_leaf_ranges() {
        let (store, file) = chunked_file_fixture(3, 16);
        let visitor = RecordingVisitor::default();

        iterate_node(&store, file.root, &visitor).await.unwrap();

        assert_eq!(
            visitor.roots.lock().unwrap().as_slice(),
            &[(file.root, NodeKind::File)]
        );
        let ranges = visitor.ranges.lock().unwrap();
        assert_eq!(ranges.len(), 3);
        for (i, range) in ranges.iter().enumerate() {
            let (root, cid, depth, byte_min, byte_max, leaf) = range;
            assert_eq!(*root, file.root);
            assert_eq!(*cid, file.leaves[i]);
            assert_eq!(*depth, 0);
            assert_eq!(*byte_min, i as u64 * 16);
            assert_eq!(*byte_max, (i as u64 + 1) * 16);
            assert!(*leaf);
        }
    }

    #[tokio::test]
    async fn layered_file_emits_children_before_parents() {
        // two intermediate nodes of two leaves each under one root
        let (store, file) = layered_file_fixture(2, 2, 16);
        let visitor = RecordingVisitor::default();

        iterate_node(&store, file.root, &visitor).await.unwrap();

        let ranges = visitor.ranges.lock().unwrap();
        // 4 leaves at depth 1 plus 2 intermediates at depth 0
        assert_eq!(ranges.len(), 6);
        assert_eq!(
            ranges
                .iter()
                .map(|r| (r.2, r.3, r.4, r.5))
                .collect::<Vec<_>>(),
            vec![
                (1, 0, 16, true),
                (1, 16, 32, true),
                (0, 0, 32, false),
                (1, 32, 48, true),
                (1, 48, 64, true),
                (0, 32, 64, false),
            ]
        );
    }

    #[tokio::test]
    async fn directory_emits_single_block_chains() {
        let (store, dir) = directory_fixture();
        let visitor = RecordingVisitor::default();

        iterate_node(&store, dir.root, &visitor).await.unwrap();

        assert_eq!(
            visitor.roots.lock().unwrap().as_slice(),
            &[(dir.root, NodeKind::Directory)]
        );
        let paths = visitor.paths.lock().unwrap();
        let expected: Vec<_> = dir
            .entries
            .iter()
            .map(|(name, cid)| (dir.root, name.clone(), vec![*cid]))
            .collect();
        assert_eq!(paths.as_slice(), expected.as_slice());
    }

    #[tokio::test]
    async fn hamt_emits_shard_chains_and_strips_prefixes() {
        let (store, hamt) = hamt_fixture();
        let visitor = RecordingVisitor::default();

        iterate_node(&store, hamt.root, &visitor).await.unwrap();

        assert_eq!(
            visitor.roots.lock().unwrap().as_slice(),
            &[(hamt.root, NodeKind::HamtShard)]
        );
        let paths = visitor.paths.lock().unwrap();
        assert_eq!(
            paths.as_slice(),
            &[
                (hamt.root, "top.txt".to_string(), vec![hamt.top_value]),
                (
                    hamt.root,
                    "nested.txt".to_string(),
                    vec![hamt.child_shard, hamt.nested_value]
                ),
            ]
        );
    }

    #[tokio::test]
    async fn raw_root_reports_kind_only() {
        let (store, cid) = raw_block_fixture(b"loose bytes");
        let visitor = RecordingVisitor::default();

        iterate_node(&store, cid, &visitor).await.unwrap();

        assert_eq!(
            visitor.roots.lock().unwrap().as_slice(),
            &[(cid, NodeKind::Raw)]
        );
        assert!(visitor.paths.lock().unwrap().is_empty());
        assert!(visitor.ranges.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn recursive_visitor_descends_into_subtrees() {
        let (store, tree) = nested_tree_fixture();
        let visitor = RecordingVisitor::default();
        let recursive = RecursiveVisitor::new(&visitor, &store);

        iterate_node(&store, tree.root, &recursive).await.unwrap();

        let roots = visitor.roots.lock().unwrap();
        assert!(roots.contains(&(tree.root, NodeKind::Directory)));
        assert!(roots.contains(&(tree.subfolder, NodeKind::Directory)));
        assert!(roots.contains(&(tree.file.root, NodeKind::File)));

        let paths = visitor.paths.lock().unwrap();
        assert!(paths.contains(&(tree.root, "subfolder".to_string(), vec![tree.subfolder])));
        assert!(paths.contains(&(
            tree.subfolder,
            "file.txt".to_string(),
            vec![tree.file.root]
        )));

        // the file subtree was walked too
        assert!(!visitor.ranges.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_tsize_on_raw_leaf_is_fatal() {
        let (store, root) = file_with_missing_tsize_fixture();
        let visitor = RecordingVisitor::default();

        let err = iterate_node(&store, root, &visitor).await.unwrap_err();
        assert!(matches!(err, Error::Decode(DecodeError::MissingTSize)));
    }

    #[tokio::test]
    async fn node_without_data_is_not_unixfs() {
        let (store, root) = bare_pb_node_fixture();
        let visitor = RecordingVisitor::default();

        let err = iterate_node(&store, root, &visitor).await.unwrap_err();
        assert!(matches!(err, Error::Decode(DecodeError::NotUnixFs)));
    }
}
