//! CIDv1 construction and verification helpers.

use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};

/// Multicodec for raw (opaque, link-free) blocks.
pub const RAW_CODEC: u64 = 0x55;
/// Multicodec for dag-pb nodes.
pub const DAG_PB_CODEC: u64 = 0x70;
/// Multicodec for dag-cbor documents.
pub const DAG_CBOR_CODEC: u64 = 0x71;

/// SHA2-256 multihash code (standard).
const SHA2_256: u64 = 0x12;

/// Hash `bytes` with SHA2-256 and tag the digest with `codec`.
pub fn cid_sha2_256(codec: u64, bytes: &[u8]) -> Cid {
    let digest = Sha256::digest(bytes);
    // SHA2-256 produces 32 bytes, which always fits in Multihash<64>.
    let mh = Multihash::<64>::wrap(SHA2_256, &digest).expect("SHA2-256 digest fits in Multihash");
    Cid::new_v1(codec, mh)
}

/// Re-hash `bytes` and check the result against `cid`'s multihash.
///
/// Use this when accepting blocks from untrusted sources. Only
/// SHA2-256 hashes can be verified; anything else fails.
pub fn verify(cid: &Cid, bytes: &[u8]) -> bool {
    let mh = cid.hash();
    if mh.code() != SHA2_256 {
        return false;
    }
    let digest = Sha256::digest(bytes);
    mh.digest() == digest.as_slice()
}
