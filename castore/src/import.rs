//! Filesystem import: converts a file or directory tree into UnixFS
//! blocks staged in a block sink.
//!
//! Files are chunked into raw leaves and stacked under dag-pb file
//! nodes; directories become basic dag-pb directory nodes with their
//! entries in name order. The walk is contents-first, so every
//! directory's children are written before the directory itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use cid::Cid;
use prost::Message;
use tokio::io::AsyncReadExt;
use tracing::instrument;
use walkdir::WalkDir;

use crate::blockservice::{Block, BlockSink};
use crate::cids::{cid_sha2_256, DAG_PB_CODEC, RAW_CODEC};
use crate::proto::{NodeKind, PbLink, PbNode, UnixfsData};
use crate::Error as CastoreError;

/// Chunk size for file leaves.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Maximum links per intermediate file node.
pub const DEFAULT_LINKS_PER_NODE: usize = 174;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("walking filesystem: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("unable to open {0}: {1}")]
    UnableToOpen(PathBuf, std::io::Error),

    #[error("unable to read {0}: {1}")]
    UnableToRead(PathBuf, std::io::Error),

    #[error("invalid encoding encountered for entry {0:?}")]
    InvalidEncoding(PathBuf),

    #[error("unsupported file type at {0}")]
    UnsupportedFileType(PathBuf),

    #[error("nothing to import at {0}")]
    EmptyWalk(PathBuf),

    #[error(transparent)]
    Store(#[from] CastoreError),
}

/// A written child: its CID, the file payload bytes it spans, and the
/// cumulative size of its DAG.
struct ChildOut {
    cid: Cid,
    span: u64,
    tsize: u64,
}

struct NamedLink {
    name: String,
    out: ChildOut,
}

/// Ingest the filesystem tree at `path`, returning the root CID.
///
/// Symlinks below the root are ingested as symlink nodes, never
/// followed.
#[instrument(skip(sink), err)]
pub async fn ingest_path(
    sink: &dyn BlockSink,
    path: &Path,
    chunk_size: usize,
) -> Result<Cid, ImportError> {
    // each directory collects its children here until its own entry
    // arrives (the walk is contents-first)
    let mut pending: HashMap<PathBuf, Vec<NamedLink>> = HashMap::new();

    let walker = WalkDir::new(path)
        .follow_links(false)
        .contents_first(true)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry?;
        let file_type = entry.file_type();
        let out = if file_type.is_dir() {
            let children = pending.remove(entry.path()).unwrap_or_default();
            write_directory(sink, children).await?
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())
                .map_err(|e| ImportError::UnableToOpen(entry.path().to_path_buf(), e))?;
            write_symlink(sink, &target).await?
        } else if file_type.is_file() {
            ingest_file(sink, entry.path(), chunk_size).await?
        } else {
            return Err(ImportError::UnsupportedFileType(entry.path().to_path_buf()));
        };

        if entry.depth() == 0 {
            return Ok(out.cid);
        }

        let name = entry
            .file_name()
            .to_str()
            .ok_or_else(|| ImportError::InvalidEncoding(entry.path().to_path_buf()))?
            .to_owned();
        let parent = entry
            .path()
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .to_path_buf();
        pending.entry(parent).or_default().push(NamedLink { name, out });
    }

    Err(ImportError::EmptyWalk(path.to_path_buf()))
}

/// Chunk one file into raw leaves and stack file nodes over them until
/// a single root remains. Even a single-chunk file gets a file node
/// wrapper, so a file root is always a dag-pb node of kind File.
async fn ingest_file(
    sink: &dyn BlockSink,
    path: &Path,
    chunk_size: usize,
) -> Result<ChildOut, ImportError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ImportError::UnableToOpen(path.to_path_buf(), e))?;

    let mut links: Vec<ChildOut> = Vec::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let mut filled = 0;
        while filled < buf.len() {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| ImportError::UnableToRead(path.to_path_buf(), e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        let data = buf[..filled].to_vec();
        let cid = cid_sha2_256(RAW_CODEC, &data);
        sink.put(Block {
            cid,
            data: data.into(),
        })
        .await?;
        links.push(ChildOut {
            cid,
            span: filled as u64,
            tsize: filled as u64,
        });
        if filled < buf.len() {
            break;
        }
    }

    if links.is_empty() {
        return write_file_node(sink, &[]).await;
    }
    loop {
        let mut parents = Vec::with_capacity(links.len().div_ceil(DEFAULT_LINKS_PER_NODE));
        for group in links.chunks(DEFAULT_LINKS_PER_NODE) {
            parents.push(write_file_node(sink, group).await?);
        }
        links = parents;
        if links.len() == 1 {
            return Ok(links.remove(0));
        }
    }
}

async fn write_file_node(
    sink: &dyn BlockSink,
    children: &[ChildOut],
) -> Result<ChildOut, ImportError> {
    let node = PbNode {
        links: children
            .iter()
            .map(|c| PbLink {
                hash: Some(c.cid.to_bytes().into()),
                name: None,
                tsize: Some(c.tsize),
            })
            .collect(),
        data: Some(
            UnixfsData {
                data_type: NodeKind::File.as_i64(),
                filesize: Some(children.iter().map(|c| c.span).sum()),
                blocksizes: children.iter().map(|c| c.span).collect(),
                ..Default::default()
            }
            .encode_to_vec()
            .into(),
        ),
    };
    write_node(sink, node, children).await
}

async fn write_directory(
    sink: &dyn BlockSink,
    mut entries: Vec<NamedLink>,
) -> Result<ChildOut, ImportError> {
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    let node = PbNode {
        links: entries
            .iter()
            .map(|e| PbLink {
                hash: Some(e.out.cid.to_bytes().into()),
                name: Some(e.name.clone()),
                tsize: Some(e.out.tsize),
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
    };
    let children: Vec<ChildOut> = entries.into_iter().map(|e| e.out).collect();
    write_node(sink, node, &children).await
}

async fn write_symlink(sink: &dyn BlockSink, target: &Path) -> Result<ChildOut, ImportError> {
    let target = target
        .to_str()
        .ok_or_else(|| ImportError::InvalidEncoding(target.to_path_buf()))?;
    let node = PbNode {
        links: vec![],
        data: Some(
            UnixfsData {
                data_type: NodeKind::Symlink.as_i64(),
                data: Some(target.as_bytes().to_vec().into()),
                filesize: Some(target.len() as u64),
                ..Default::default()
            }
            .encode_to_vec()
            .into(),
        ),
    };
    write_node(sink, node, &[]).await
}

async fn write_node(
    sink: &dyn BlockSink,
    node: PbNode,
    children: &[ChildOut],
) -> Result<ChildOut, ImportError> {
    let raw = node.encode_to_vec();
    let cid = cid_sha2_256(DAG_PB_CODEC, &raw);
    let span = children.iter().map(|c| c.span).sum();
    let tsize = children.iter().map(|c| c.tsize).sum::<u64>() + raw.len() as u64;
    sink.put(Block {
        cid,
        data: raw.into(),
    })
    .await?;
    Ok(ChildOut { cid, span, tsize })
}
