//! dag-pb and UnixFS protobuf messages.
//!
//! The message shapes are stable enough to declare with prost derives
//! rather than a generated module. `PbNode` declares `links` before
//! `data` so the derived encoder emits links first, which is the
//! canonical dag-pb field order.

use bytes::Bytes;
use cid::Cid;
use prost::Message;

use crate::DecodeError;

/// A dag-pb node: a list of named links plus an opaque data field.
#[derive(Clone, PartialEq, Message)]
pub struct PbNode {
    #[prost(message, repeated, tag = "2")]
    pub links: Vec<PbLink>,
    #[prost(bytes = "bytes", optional, tag = "1")]
    pub data: Option<Bytes>,
}

/// One link of a dag-pb node.
#[derive(Clone, PartialEq, Message)]
pub struct PbLink {
    #[prost(bytes = "bytes", optional, tag = "1")]
    pub hash: Option<Bytes>,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(uint64, optional, tag = "3")]
    pub tsize: Option<u64>,
}

/// The UnixFS `Data` structure carried in a dag-pb node's data field.
#[derive(Clone, PartialEq, Message)]
pub struct UnixfsData {
    #[prost(int64, tag = "1")]
    pub data_type: i64,
    #[prost(bytes = "bytes", optional, tag = "2")]
    pub data: Option<Bytes>,
    #[prost(uint64, optional, tag = "3")]
    pub filesize: Option<u64>,
    #[prost(uint64, repeated, packed = "false", tag = "4")]
    pub blocksizes: Vec<u64>,
    #[prost(uint64, optional, tag = "5")]
    pub hash_type: Option<u64>,
    #[prost(uint64, optional, tag = "6")]
    pub fanout: Option<u64>,
    #[prost(uint32, optional, tag = "7")]
    pub mode: Option<u32>,
}

/// The UnixFS node kinds, as stored in [UnixfsData::data_type].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum NodeKind {
    Raw = 0,
    Directory = 1,
    File = 2,
    Metadata = 3,
    Symlink = 4,
    HamtShard = 5,
}

impl NodeKind {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }
}

impl TryFrom<i64> for NodeKind {
    type Error = DecodeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NodeKind::Raw),
            1 => Ok(NodeKind::Directory),
            2 => Ok(NodeKind::File),
            3 => Ok(NodeKind::Metadata),
            4 => Ok(NodeKind::Symlink),
            5 => Ok(NodeKind::HamtShard),
            other => Err(DecodeError::InvalidDataType(other)),
        }
    }
}

impl PbNode {
    /// Decode a dag-pb block.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        PbNode::decode(data).map_err(|_| DecodeError::NotProtobuf)
    }
}

impl PbLink {
    /// The link target as a CID.
    pub fn cid(&self) -> Result<Cid, DecodeError> {
        let hash = self.hash.as_ref().ok_or(DecodeError::InvalidLinkHash)?;
        Cid::try_from(hash.as_ref()).map_err(|_| DecodeError::InvalidLinkHash)
    }
}

impl UnixfsData {
    /// Decode the UnixFS structure out of a dag-pb node's data field.
    /// An absent data field means the node is not a UnixFS node.
    pub fn from_node(node: &PbNode) -> Result<Self, DecodeError> {
        let data = node.data.as_ref().ok_or(DecodeError::NotUnixFs)?;
        UnixfsData::decode(data.as_ref()).map_err(|_| DecodeError::NotUnixFs)
    }

    pub fn kind(&self) -> Result<NodeKind, DecodeError> {
        NodeKind::try_from(self.data_type)
    }
}

/// How a HAMT shard link is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkClass {
    /// Points at a child shard of the same directory.
    ShardPointer,
    /// A leaf entry; the name minus the bucket prefix is the label.
    ValueEntry,
}

/// The fixed width of the hex-padded bucket index prefixing every link
/// name in a shard with the given UnixFS data.
pub fn hamt_pad_length(ufs: &UnixfsData) -> Result<usize, DecodeError> {
    let fanout = ufs.fanout.ok_or(DecodeError::MissingFanout)?;
    Ok(format!("{:X}", fanout.saturating_sub(1)).len())
}

/// Classify a HAMT shard link by its name length relative to the
/// shard's bucket prefix width.
pub fn classify_hamt_link(link: &PbLink, pad_length: usize) -> Result<LinkClass, DecodeError> {
    let name = link.name.as_deref().ok_or(DecodeError::MissingLinkName)?;
    if name.len() < pad_length {
        return Err(DecodeError::InvalidLinkName(name.to_string()));
    }
    if name.len() == pad_length {
        Ok(LinkClass::ShardPointer)
    } else {
        Ok(LinkClass::ValueEntry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cids::{cid_sha2_256, RAW_CODEC};

    #[test]
    fn node_round_trip() {
        let child = cid_sha2_256(RAW_CODEC, b"leaf");
        let node = PbNode {
            links: vec![PbLink {
                hash: Some(child.to_bytes().into()),
                name: Some("file.txt".into()),
                tsize: Some(4),
            }],
            data: Some(
                UnixfsData {
                    data_type: NodeKind::Directory.as_i64(),
                    ..Default::default()
                }
                .encode_to_vec()
                .into(),
            ),
        };

        let decoded = PbNode::from_bytes(&node.encode_to_vec()).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(decoded.links[0].cid().unwrap(), child);

        let ufs = UnixfsData::from_node(&decoded).unwrap();
        assert_eq!(ufs.kind().unwrap(), NodeKind::Directory);
    }

    #[test]
    fn data_field_encodes_after_links() {
        let node = PbNode {
            links: vec![PbLink {
                hash: Some(cid_sha2_256(RAW_CODEC, b"x").to_bytes().into()),
                name: None,
                tsize: None,
            }],
            data: Some(Bytes::from_static(b"d")),
        };
        let raw = node.encode_to_vec();
        // field 2 (links), wire type 2 -> 0x12; field 1 (data) -> 0x0a
        assert_eq!(raw[0], 0x12);
        let link_len = raw[1] as usize;
        assert_eq!(raw[2 + link_len], 0x0a);
    }

    #[test]
    fn missing_data_is_not_unixfs() {
        let node = PbNode::default();
        assert_eq!(UnixfsData::from_node(&node), Err(DecodeError::NotUnixFs));
    }

    #[test]
    fn pad_length_by_fanout() {
        for (fanout, expected) in [(16u64, 1usize), (256, 2), (4096, 3)] {
            let ufs = UnixfsData {
                data_type: NodeKind::HamtShard.as_i64(),
                fanout: Some(fanout),
                ..Default::default()
            };
            assert_eq!(hamt_pad_length(&ufs).unwrap(), expected);
        }

        let ufs = UnixfsData {
            data_type: NodeKind::HamtShard.as_i64(),
            ..Default::default()
        };
        assert_eq!(hamt_pad_length(&ufs), Err(DecodeError::MissingFanout));
    }

    #[test]
    fn hamt_link_classification() {
        let link = |name: Option<&str>| PbLink {
            hash: Some(cid_sha2_256(RAW_CODEC, b"x").to_bytes().into()),
            name: name.map(str::to_string),
            tsize: None,
        };

        assert_eq!(
            classify_hamt_link(&link(Some("0F")), 2).unwrap(),
            LinkClass::ShardPointer
        );
        assert_eq!(
            classify_hamt_link(&link(Some("0Ffile.txt")), 2).unwrap(),
            LinkClass::ValueEntry
        );
        assert_eq!(
            classify_hamt_link(&link(None), 2),
            Err(DecodeError::MissingLinkName)
        );
        assert_eq!(
            classify_hamt_link(&link(Some("A")), 2),
            Err(DecodeError::InvalidLinkName("A".to_string()))
        );
    }
}
