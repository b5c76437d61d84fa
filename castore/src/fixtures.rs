//! Hand-built UnixFS DAG fixtures for tests.
//!
//! Nodes are assembled directly from the proto structs rather than
//! through [crate::import], so the walkers are exercised against
//! independently constructed DAGs.

use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use prost::Message;

use crate::blockservice::{Block, MemoryBlockService};
use crate::cids::{cid_sha2_256, DAG_PB_CODEC, RAW_CODEC};
use crate::proto::{NodeKind, PbLink, PbNode, UnixfsData};
use crate::traverse::UnixFsVisitor;
use crate::Error;

/// Records every traversal event for assertions.
#[derive(Default)]
pub struct RecordingVisitor {
    pub roots: Mutex<Vec<(Cid, NodeKind)>>,
    pub paths: Mutex<Vec<(Cid, String, Vec<Cid>)>>,
    pub ranges: Mutex<Vec<(Cid, Cid, u64, u64, u64, bool)>>,
}

#[async_trait]
impl UnixFsVisitor for RecordingVisitor {
    async fn on_root(&self, root: Cid, kind: NodeKind) -> Result<(), Error> {
        self.roots.lock().expect("lock poisoned").push((root, kind));
        Ok(())
    }

    async fn on_path(&self, root: Cid, label: &str, chain: &[Cid]) -> Result<(), Error> {
        self.paths
            .lock()
            .expect("lock poisoned")
            .push((root, label.to_string(), chain.to_vec()));
        Ok(())
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
        self.ranges
            .lock()
            .expect("lock poisoned")
            .push((root, cid, depth, byte_min, byte_max, leaf));
        Ok(())
    }
}

pub struct FileFixture {
    pub root: Cid,
    pub leaves: Vec<Cid>,
    pub size: u64,
}

pub struct DirFixture {
    pub root: Cid,
    pub entries: Vec<(String, Cid)>,
}

pub struct HamtFixture {
    pub root: Cid,
    pub top_value: Cid,
    pub child_shard: Cid,
    pub nested_value: Cid,
}

pub struct TreeFixture {
    pub root: Cid,
    pub subfolder: Cid,
    pub file: FileFixture,
}

/// Store a raw leaf and return its CID.
pub fn put_raw(store: &MemoryBlockService, data: Vec<u8>) -> Cid {
    let cid = cid_sha2_256(RAW_CODEC, &data);
    store.insert(Block {
        cid,
        data: data.into(),
    });
    cid
}

/// Encode and store a dag-pb node and return its CID.
pub fn put_node(store: &MemoryBlockService, node: &PbNode) -> Cid {
    let raw = node.encode_to_vec();
    let cid = cid_sha2_256(DAG_PB_CODEC, &raw);
    store.insert(Block {
        cid,
        data: raw.into(),
    });
    cid
}

/// A file node over `(cid, span)` children; `span` doubles as the
/// link tsize, which is what raw leaves require.
pub fn file_node(children: &[(Cid, u64)]) -> PbNode {
    PbNode {
        links: children
            .iter()
            .map(|(cid, span)| PbLink {
                hash: Some(cid.to_bytes().into()),
                name: None,
                tsize: Some(*span),
            })
            .collect(),
        data: Some(
            UnixfsData {
                data_type: NodeKind::File.as_i64(),
                filesize: Some(children.iter().map(|(_, span)| span).sum()),
                blocksizes: children.iter().map(|(_, span)| *span).collect(),
                ..Default::default()
            }
            .encode_to_vec()
            .into(),
        ),
    }
}

/// A basic directory node over named entries.
pub fn dir_node(entries: &[(String, Cid)]) -> PbNode {
    PbNode {
        links: entries
            .iter()
            .map(|(name, cid)| PbLink {
                hash: Some(cid.to_bytes().into()),
                name: Some(name.clone()),
                tsize: Some(0),
            })
            .collect(),
        data: Some(
            UnixfsData {
                data_type: NodeKind::Directory.as_i64(),
                ..Default::default()
            }
            .encode_to_vec()
            .into(),
        ),
    }
}

/// A HAMT shard node with the given fanout and raw (already prefixed)
/// link names.
pub fn hamt_node(fanout: u64, links: &[(String, Cid)]) -> PbNode {
    PbNode {
        links: links
            .iter()
            .map(|(name, cid)| PbLink {
                hash: Some(cid.to_bytes().into()),
                name: Some(name.clone()),
                tsize: Some(0),
            })
            .collect(),
        data: Some(
            UnixfsData {
                data_type: NodeKind::HamtShard.as_i64(),
                // bitfield contents are irrelevant to the walkers
                data: Some(Bytes::from_static(&[0xff; 32])),
                hash_type: Some(0x22),
                fanout: Some(fanout),
                ..Default::default()
            }
            .encode_to_vec()
            .into(),
        ),
    }
}

/// A flat file of `chunks` raw leaves, `chunk_size` bytes each.
pub fn chunked_file_fixture(chunks: usize, chunk_size: u64) -> (MemoryBlockService, FileFixture) {
    let store = MemoryBlockService::default();
    let file = chunked_file_into(&store, chunks, chunk_size, 0);
    (store, file)
}

/// Build a flat chunked file into an existing store. `seed` varies the
/// leaf contents so fixtures sharing a store do not collide.
pub fn chunked_file_into(
    store: &MemoryBlockService,
    chunks: usize,
    chunk_size: u64,
    seed: u8,
) -> FileFixture {
    let children: Vec<(Cid, u64)> = (0..chunks)
        .map(|i| {
            let data = vec![seed.wrapping_add(i as u8); chunk_size as usize];
            (put_raw(store, data), chunk_size)
        })
        .collect();
    let root = put_node(store, &file_node(&children));
    FileFixture {
        root,
        leaves: children.iter().map(|(cid, _)| *cid).collect(),
        size: chunks as u64 * chunk_size,
    }
}

/// A two-level file: `nodes` intermediate file nodes of
/// `leaves_per_node` raw leaves each, under a single root.
pub fn layered_file_fixture(
    nodes: usize,
    leaves_per_node: usize,
    chunk_size: u64,
) -> (MemoryBlockService, FileFixture) {
    let store = MemoryBlockService::default();
    let mut leaves = Vec::new();
    let mut intermediates = Vec::new();
    for n in 0..nodes {
        let children: Vec<(Cid, u64)> = (0..leaves_per_node)
            .map(|i| {
                let data = vec![(n * leaves_per_node + i) as u8; chunk_size as usize];
                (put_raw(&store, data), chunk_size)
            })
            .collect();
        leaves.extend(children.iter().map(|(cid, _)| *cid));
        let span = leaves_per_node as u64 * chunk_size;
        intermediates.push((put_node(&store, &file_node(&children)), span));
    }
    let root = put_node(&store, &file_node(&intermediates));
    (
        store,
        FileFixture {
            root,
            leaves,
            size: (nodes * leaves_per_node) as u64 * chunk_size,
        },
    )
}

/// A basic directory with two raw-leaf entries.
pub fn directory_fixture() -> (MemoryBlockService, DirFixture) {
    let store = MemoryBlockService::default();
    let a = put_raw(&store, b"contents of a".to_vec());
    let b = put_raw(&store, b"contents of b".to_vec());
    let entries = vec![("a.txt".to_string(), a), ("b.txt".to_string(), b)];
    let root = put_node(&store, &dir_node(&entries));
    (store, DirFixture { root, entries })
}

/// A sharded directory: the root shard holds one value entry and one
/// child shard, which holds a second value entry. Fanout 256, so link
/// names carry a two-character bucket prefix.
pub fn hamt_fixture() -> (MemoryBlockService, HamtFixture) {
    let store = MemoryBlockService::default();
    let top_value = put_raw(&store, b"top value".to_vec());
    let nested_value = put_raw(&store, b"nested value".to_vec());

    let child_shard = put_node(
        &store,
        &hamt_node(256, &[("00nested.txt".to_string(), nested_value)]),
    );
    let root = put_node(
        &store,
        &hamt_node(
            256,
            &[
                ("3Atop.txt".to_string(), top_value),
                ("7B".to_string(), child_shard),
            ],
        ),
    );
    (
        store,
        HamtFixture {
            root,
            top_value,
            child_shard,
            nested_value,
        },
    )
}

/// `root/subfolder/file.txt` where the file is two 8-byte chunks.
pub fn nested_tree_fixture() -> (MemoryBlockService, TreeFixture) {
    let store = MemoryBlockService::default();
    let file = chunked_file_into(&store, 2, 8, 0x40);
    let subfolder = put_node(&store, &dir_node(&[("file.txt".to_string(), file.root)]));
    let root = put_node(&store, &dir_node(&[("subfolder".to_string(), subfolder)]));
    (
        store,
        TreeFixture {
            root,
            subfolder,
            file,
        },
    )
}

/// A single raw block.
pub fn raw_block_fixture(data: &[u8]) -> (MemoryBlockService, Cid) {
    let store = MemoryBlockService::default();
    let cid = put_raw(&store, data.to_vec());
    (store, cid)
}

/// A file node whose raw leaf link is missing its tsize.
pub fn file_with_missing_tsize_fixture() -> (MemoryBlockService, Cid) {
    let store = MemoryBlockService::default();
    let leaf = put_raw(&store, vec![0u8; 16]);
    let node = PbNode {
        links: vec![PbLink {
            hash: Some(leaf.to_bytes().into()),
            name: None,
            tsize: None,
        }],
        data: Some(
            UnixfsData {
                data_type: NodeKind::File.as_i64(),
                filesize: Some(16),
                blocksizes: vec![16],
                ..Default::default()
            }
            .encode_to_vec()
            .into(),
        ),
    };
    let root = put_node(&store, &node);
    (store, root)
}

/// A dag-pb node with no data field at all.
pub fn bare_pb_node_fixture() -> (MemoryBlockService, Cid) {
    let store = MemoryBlockService::default();
    let root = put_node(&store, &PbNode::default());
    (store, root)
}
