//! The UnixFS resolvers: path and query resolution over the SQL
//! index, per the StarGate UnixFS app semantics.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use tracing::instrument;

use stargate_castore::blockservice::BlockService;
use stargate_castore::proto::NodeKind;

use crate::index::SqlUnixFsIndex;
use crate::messages::{BlockMetadatum, BlockStatus, DagMessage, Ordering, PathMessage};
use crate::resolver::{AppResolver, PathResolver, PathSegments, Query, QueryResolver};
use crate::{Error, RootCid, TraversedCid};

/// Opens a block source for a root from its provenance metadata.
#[async_trait]
pub trait BlockSourceOpener: Send + Sync {
    async fn open(&self, root: &Cid, metadata: &[u8]) -> Result<Arc<dyn BlockService>, Error>;
}

/// The UnixFS [AppResolver]: looks a root up in the index and serves
/// it from whichever of its recorded sources opens.
pub struct UnixFsAppResolver {
    index: Arc<SqlUnixFsIndex>,
    opener: Arc<dyn BlockSourceOpener>,
}

impl UnixFsAppResolver {
    pub fn new(index: Arc<SqlUnixFsIndex>, opener: Arc<dyn BlockSourceOpener>) -> Self {
        Self { index, opener }
    }
}

#[async_trait]
impl AppResolver for UnixFsAppResolver {
    #[instrument(skip(self), err)]
    async fn get_resolver(
        &self,
        root: Cid,
    ) -> Result<(Arc<dyn BlockService>, Box<dyn PathResolver>), Error> {
        let rows = self.index.root_cid(root).await?;
        if rows.is_empty() {
            return Err(Error::NotFound(root));
        }
        // rows arrive newest import first; take the first source that
        // still opens
        let mut last_error = None;
        for row in rows {
            match self.opener.open(&row.cid, &row.metadata).await {
                Ok(blocks) => {
                    let resolver = UnixFsPathResolver {
                        index: self.index.clone(),
                        root: row,
                    };
                    return Ok((blocks, Box::new(resolver)));
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or(Error::NotFound(root)))
    }
}

/// A [PathResolver] rooted at one RootCID record.
pub struct UnixFsPathResolver {
    index: Arc<SqlUnixFsIndex>,
    root: RootCid,
}

struct TraversalState {
    root: RootCid,
    current_path: String,
    blocks: Vec<BlockMetadatum>,
}

impl UnixFsPathResolver {
    async fn traverse_segment(
        &self,
        mut state: TraversalState,
        segment: &str,
    ) -> Result<TraversalState, Error> {
        // only directory kinds can be pathed into
        if state.root.kind != NodeKind::Directory && state.root.kind != NodeKind::HamtShard {
            return Err(Error::Path {
                cid: state.root.cid,
                path: state.current_path,
                cause: "cannot path into a file, must be a directory".to_string(),
            });
        }
        let chain = self
            .index
            .dir_path(state.root.cid, &state.root.metadata, segment)
            .await?;
        let Some((leaf, proof)) = chain.split_last() else {
            return Err(Error::Path {
                cid: state.root.cid,
                path: state.current_path,
                cause: format!("no file or folder {segment}"),
            });
        };
        for cid in proof {
            state.blocks.push(BlockMetadatum {
                link: *cid,
                status: BlockStatus::Present,
            });
        }
        let next_root = self
            .index
            .root_cid_with_metadata(*leaf, &state.root.metadata)
            .await?
            .ok_or(Error::NotFound(*leaf))?;
        state.root = next_root;
        state.current_path.push('/');
        state.current_path.push_str(segment);
        Ok(state)
    }
}

#[async_trait]
impl PathResolver for UnixFsPathResolver {
    /// Resolves every remaining segment in one step, returning a
    /// single path message for the whole run and a resolver rooted at
    /// its end.
    async fn resolve_path_segments(
        &self,
        segments: &[String],
    ) -> Result<(PathMessage, PathSegments, Box<dyn PathResolver>), Error> {
        let mut state = TraversalState {
            root: self.root.clone(),
            current_path: String::new(),
            blocks: Vec::with_capacity(segments.len() * 4),
        };
        for segment in segments {
            state = self.traverse_segment(state, segment).await?;
        }
        let resolver = UnixFsPathResolver {
            index: self.index.clone(),
            root: state.root,
        };
        Ok((
            PathMessage {
                segments: segments.to_vec(),
                blocks: state.blocks,
            },
            Vec::new(),
            Box::new(resolver),
        ))
    }

    async fn resolve_query(&self, query: &Query) -> Result<Box<dyn QueryResolver>, Error> {
        Ok(Box::new(UnixFsQueryResolver {
            index: self.index.clone(),
            query: query.clone(),
            root: self.root.clone(),
            fulfilled: false,
        }))
    }
}

/// A [QueryResolver] producing the single DAG message of a UnixFS
/// query, in breadth-first ordering.
pub struct UnixFsQueryResolver {
    index: Arc<SqlUnixFsIndex>,
    query: Query,
    root: RootCid,
    fulfilled: bool,
}

impl UnixFsQueryResolver {
    async fn directory_query(&self) -> Result<DagMessage, Error> {
        let layers = self
            .index
            .dir_ls(self.root.cid, &self.root.metadata)
            .await?;
        let mut blocks = Vec::with_capacity(1 + layers.iter().map(Vec::len).sum::<usize>());
        blocks.push(BlockMetadatum {
            link: self.root.cid,
            status: BlockStatus::Present,
        });
        for layer in layers {
            for traversed in layer {
                // an ls sends the shape, not the entries themselves
                let status = if traversed.is_leaf {
                    BlockStatus::NotSent
                } else {
                    BlockStatus::Present
                };
                blocks.push(BlockMetadatum {
                    link: traversed.cid,
                    status,
                });
            }
        }
        Ok(DagMessage {
            ordering: Ordering::BreadthFirst,
            blocks,
        })
    }

    async fn file_query(&self) -> Result<DagMessage, Error> {
        let layers = self
            .index
            .file_all(self.root.cid, &self.root.metadata)
            .await?;

        // `bytes` narrows the result to blocks overlapping the range
        let byte_sets: Option<Vec<HashSet<Cid>>> = match self.query.first("bytes") {
            None => None,
            Some(raw) => {
                let (byte_min, byte_max) = split_bytes_param(raw)?;
                let range_layers = self
                    .index
                    .file_byte_range(self.root.cid, &self.root.metadata, byte_min, byte_max)
                    .await?;
                Some(
                    range_layers
                        .into_iter()
                        .map(|layer: Vec<TraversedCid>| {
                            layer.into_iter().map(|tc| tc.cid).collect()
                        })
                        .collect(),
                )
            }
        };
        let send_leaves = !self.query.contains("noleaves");

        let mut blocks = Vec::with_capacity(1 + layers.iter().map(Vec::len).sum::<usize>());
        blocks.push(BlockMetadatum {
            link: self.root.cid,
            status: BlockStatus::Present,
        });
        for (depth, layer) in layers.into_iter().enumerate() {
            for traversed in layer {
                let mut status = BlockStatus::Present;
                if let Some(sets) = &byte_sets {
                    let in_range = sets
                        .get(depth)
                        .is_some_and(|set| set.contains(&traversed.cid));
                    if !in_range {
                        status = BlockStatus::NotSent;
                    }
                }
                if traversed.is_leaf && !send_leaves {
                    status = BlockStatus::NotSent;
                }
                blocks.push(BlockMetadatum {
                    link: traversed.cid,
                    status,
                });
            }
        }
        Ok(DagMessage {
            ordering: Ordering::BreadthFirst,
            blocks,
        })
    }
}

#[async_trait]
impl QueryResolver for UnixFsQueryResolver {
    async fn next(&mut self) -> Result<DagMessage, Error> {
        if self.fulfilled {
            return Err(Error::NoMoreMessages);
        }
        self.fulfilled = true;
        match self.root.kind {
            NodeKind::Directory | NodeKind::HamtShard => self.directory_query().await,
            NodeKind::File => self.file_query().await,
            NodeKind::Raw => Ok(DagMessage {
                ordering: Ordering::BreadthFirst,
                blocks: vec![BlockMetadatum {
                    link: self.root.cid,
                    status: BlockStatus::Present,
                }],
            }),
            other => Err(Error::Storage(format!(
                "unsupported file type: {}",
                other.as_i64()
            ))),
        }
    }

    fn done(&self) -> bool {
        self.fulfilled
    }
}

/// Parse a `bytes=<min>-<max>` value: decimal, single dash, nothing
/// else.
fn split_bytes_param(raw: &str) -> Result<(u64, u64), Error> {
    let invalid = || Error::InvalidRequest(format!("incorrectly formatted bytes param {raw:?}"));
    let (min, max) = raw.split_once('-').ok_or_else(invalid)?;
    if min.is_empty()
        || max.is_empty()
        || !min.bytes().all(|b| b.is_ascii_digit())
        || !max.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }
    let byte_min = min.parse().map_err(|_| invalid())?;
    let byte_max = max.parse().map_err(|_| invalid())?;
    Ok((byte_min, byte_max))
}
