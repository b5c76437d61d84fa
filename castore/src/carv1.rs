//! CAR v1 wire format.
//!
//! A CAR stream is a dag-cbor header document followed by a sequence
//! of records, each written as an unsigned varint length prefix and
//! then that many bytes. Block records are `cid ++ block_bytes`.

use bytes::Bytes;
use cid::Cid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Error;

/// Upper bound on a single record, to keep a corrupt length prefix
/// from allocating unbounded memory.
pub const MAX_SECTION_SIZE: u64 = 32 << 20;

/// The CAR v1 header document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarHeader {
    pub roots: Vec<Cid>,
    pub version: u64,
}

impl CarHeader {
    pub fn new(roots: Vec<Cid>) -> Self {
        Self { roots, version: 1 }
    }
}

/// Write an unsigned varint.
pub async fn write_uvarint<W>(w: &mut W, mut value: u64) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 10];
    let mut n = 0;
    loop {
        let b = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[n] = b;
            n += 1;
            break;
        }
        buf[n] = b | 0x80;
        n += 1;
    }
    w.write_all(&buf[..n]).await?;
    Ok(())
}

/// Read an unsigned varint. Returns `None` on a clean EOF before the
/// first byte.
pub async fn read_uvarint<R>(r: &mut R) -> Result<Option<u64>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut first = true;
    loop {
        let mut byte = [0u8; 1];
        match r.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(e) if first && e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        first = false;
        let b = byte[0];
        if shift > 63 || (shift == 63 && b > 1) {
            return Err(Error::StorageError("varint overflows u64".into()));
        }
        value |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
    }
}

/// Sync counterpart of [read_uvarint], for positioned file scans.
/// Advances `pos` by the number of bytes consumed.
pub(crate) fn read_uvarint_sync<R>(r: &mut R, pos: &mut u64) -> Result<Option<u64>, Error>
where
    R: std::io::Read,
{
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut first = true;
    loop {
        let mut byte = [0u8; 1];
        match r.read_exact(&mut byte) {
            Ok(_) => {}
            Err(e) if first && e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        first = false;
        *pos += 1;
        let b = byte[0];
        if shift > 63 || (shift == 63 && b > 1) {
            return Err(Error::StorageError("varint overflows u64".into()));
        }
        value |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
    }
}

/// Write one record: varint length prefix, then `prefix ++ payload`.
pub async fn ld_write<W>(w: &mut W, prefix: &[u8], payload: &[u8]) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    write_uvarint(w, (prefix.len() + payload.len()) as u64).await?;
    w.write_all(prefix).await?;
    w.write_all(payload).await?;
    Ok(())
}

/// Write the header as a length-prefixed dag-cbor document.
pub async fn write_header<W>(w: &mut W, header: &CarHeader) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let raw = serde_ipld_dagcbor::to_vec(header)
        .map_err(|e| Error::StorageError(format!("encoding car header: {e}")))?;
    ld_write(w, &raw, &[]).await
}

/// Read and decode the header document.
pub async fn read_header<R>(r: &mut R) -> Result<CarHeader, Error>
where
    R: AsyncRead + Unpin,
{
    let len = read_uvarint(r)
        .await?
        .ok_or_else(|| Error::StorageError("car stream is empty".into()))?;
    if len == 0 || len > MAX_SECTION_SIZE {
        return Err(Error::StorageError(format!("invalid car header length {len}")));
    }
    let mut raw = vec![0u8; len as usize];
    r.read_exact(&mut raw).await?;
    serde_ipld_dagcbor::from_slice(&raw)
        .map_err(|e| Error::StorageError(format!("decoding car header: {e}")))
}

/// Write one block record: `cid ++ data`.
pub async fn write_block<W>(w: &mut W, cid: &Cid, data: &[u8]) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    ld_write(w, &cid.to_bytes(), data).await
}

/// Read the next block record, or `None` at the end of the stream.
pub async fn read_block<R>(r: &mut R) -> Result<Option<(Cid, Bytes)>, Error>
where
    R: AsyncRead + Unpin,
{
    let len = match read_uvarint(r).await? {
        Some(len) => len,
        None => return Ok(None),
    };
    if len == 0 || len > MAX_SECTION_SIZE {
        return Err(Error::StorageError(format!("invalid car record length {len}")));
    }
    let mut raw = vec![0u8; len as usize];
    r.read_exact(&mut raw).await?;
    let mut cursor = std::io::Cursor::new(&raw);
    let cid = Cid::read_bytes(&mut cursor)
        .map_err(|e| Error::StorageError(format!("invalid cid in car record: {e}")))?;
    let data = Bytes::copy_from_slice(&raw[cursor.position() as usize..]);
    Ok(Some((cid, data)))
}
