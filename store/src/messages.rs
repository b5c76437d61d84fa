//! The StarGate wire messages.
//!
//! A response interleaves these messages with raw block bodies: each
//! message lists the blocks of one step of the request, and every
//! `Present` entry is followed, in order, by its block body as the
//! next records of the CAR stream.

use cid::Cid;
use serde::{Deserialize, Serialize};

use stargate_castore::cids::{cid_sha2_256, DAG_CBOR_CODEC};

use crate::Error;

/// What the server did with a given block in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    /// The block was present on this machine and its body is included
    /// in this message's block records.
    Present,
    /// The block was present but deliberately not sent; it needs to be
    /// fetched elsewhere.
    NotSent,
    /// The block was not held, so this part of the traversal was
    /// skipped over.
    Missing,
    /// The block was already traversed earlier in this response and
    /// has likely already been transmitted.
    Duplicate,
}

/// Metadata for a single link of the DAG being communicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockMetadatum {
    pub link: Cid,
    pub status: BlockStatus,
}

/// Describes the resolution of one or more path segments: the blocks
/// needed, in order, to verify each segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PathMessage {
    pub segments: Vec<String>,
    pub blocks: Vec<BlockMetadatum>,
}

/// Traversal order for the blocks of a DAG message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ordering {
    DepthFirst,
    BreadthFirst,
}

/// Describes the DAG transmitted at the end of a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DagMessage {
    pub ordering: Ordering,
    pub blocks: Vec<BlockMetadatum>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Path,
    #[serde(rename = "DAG")]
    Dag,
}

/// A complete StarGate message, ahead of a block sequence. Exactly one
/// of `path` and `dag` is set, per `kind`; the other arm encodes as
/// null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarGateMessage {
    #[serde(rename = "Kind")]
    pub kind: MessageKind,
    #[serde(rename = "Path")]
    pub path: Option<PathMessage>,
    #[serde(rename = "DAG")]
    pub dag: Option<DagMessage>,
}

impl StarGateMessage {
    pub fn path(path: PathMessage) -> Self {
        Self {
            kind: MessageKind::Path,
            path: Some(path),
            dag: None,
        }
    }

    pub fn dag(dag: DagMessage) -> Self {
        Self {
            kind: MessageKind::Dag,
            path: None,
            dag: Some(dag),
        }
    }

    /// The block metadata of whichever arm is set.
    pub fn blocks(&self) -> &[BlockMetadatum] {
        match self.kind {
            MessageKind::Path => self.path.as_ref().map(|p| &p.blocks[..]).unwrap_or(&[]),
            MessageKind::Dag => self.dag.as_ref().map(|d| &d.blocks[..]).unwrap_or(&[]),
        }
    }

    /// Canonical dag-cbor encoding plus the message CID computed over
    /// it.
    pub fn encode(&self) -> Result<(Cid, Vec<u8>), Error> {
        let raw = serde_ipld_dagcbor::to_vec(self)
            .map_err(|e| Error::Storage(format!("encoding stargate message: {e}")))?;
        let cid = cid_sha2_256(DAG_CBOR_CODEC, &raw);
        Ok((cid, raw))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, Error> {
        serde_ipld_dagcbor::from_slice(raw)
            .map_err(|e| Error::InvalidRequest(format!("decoding stargate message: {e}")))
    }
}
