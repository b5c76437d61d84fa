use cid::Cid;
use stargate_castore::proto::NodeKind;

pub mod carwriter;
pub mod index;
pub mod messages;
pub mod resolver;

mod errors;
pub use errors::Error;

/// One index entry for a DAG root. `metadata` is an opaque provenance
/// blob carrying whatever is needed to re-open a block source for the
/// root (for CAR imports, the file path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootCid {
    pub cid: Cid,
    pub kind: NodeKind,
    pub metadata: Vec<u8>,
}

/// Result shape for layered index queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraversedCid {
    pub cid: Cid,
    pub is_leaf: bool,
}
