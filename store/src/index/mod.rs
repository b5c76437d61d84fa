//! The SQL-backed UnixFS index.
//!
//! Three append-only tables populated by a one-pass DAG traversal at
//! import time, queried at serve time: `RootCIDs` classifies each
//! root, `DirLinks` records the block chain resolving every label of
//! every directory root, and `FileLinks` records the byte range of
//! every block of every file root.
//!
//! A single connection serialises all access, so writers never see
//! "database is locked". All writes for one import happen inside one
//! IMMEDIATE transaction.

use std::path::Path;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use cid::Cid;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::instrument;

use stargate_castore::blockservice::BlockService;
use stargate_castore::proto::NodeKind;
use stargate_castore::traverse::{iterate_node, RecursiveVisitor, UnixFsVisitor};
use stargate_castore::Error as CastoreError;

use crate::{Error, RootCid, TraversedCid};

/// One `DirLinks` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirLink {
    pub root_cid: Cid,
    pub metadata: Vec<u8>,
    pub cid: Cid,
    pub depth: u64,
    pub leaf: bool,
    pub sub_path: String,
}

/// One `FileLinks` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLink {
    pub root_cid: Cid,
    pub metadata: Vec<u8>,
    pub cid: Cid,
    pub depth: u64,
    pub leaf: bool,
    pub byte_min: u64,
    pub byte_max: u64,
}

const CREATE_TABLES_SQL: &str = "
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
CREATE TABLE IF NOT EXISTS RootCIDs (
    CID BLOB NOT NULL,
    Kind INTEGER NOT NULL,
    Metadata BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS RootCIDsByCid ON RootCIDs (CID);
CREATE TABLE IF NOT EXISTS DirLinks (
    RootCID BLOB NOT NULL,
    Metadata BLOB NOT NULL,
    CID BLOB NOT NULL,
    Depth INTEGER NOT NULL,
    Leaf INTEGER NOT NULL,
    SubPath TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS DirLinksByRoot ON DirLinks (RootCID, Metadata, SubPath);
CREATE TABLE IF NOT EXISTS FileLinks (
    RootCID BLOB NOT NULL,
    Metadata BLOB NOT NULL,
    CID BLOB NOT NULL,
    Depth INTEGER NOT NULL,
    Leaf INTEGER NOT NULL,
    ByteMin INTEGER NOT NULL,
    ByteMax INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS FileLinksByRoot ON FileLinks (RootCID, Metadata);
";

pub struct SqlUnixFsIndex {
    conn: Mutex<Connection>,
}

impl SqlUnixFsIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::prepare(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self, Error> {
        conn.execute_batch(CREATE_TABLES_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Walk each root (without descending into directory targets) and
    /// record what it finds, all in one transaction. `metadata` tags
    /// every row with the import's provenance.
    #[instrument(skip_all, fields(roots = roots.len()), err)]
    pub async fn add_roots(
        &self,
        roots: &[Cid],
        metadata: &[u8],
        blocks: &dyn BlockService,
    ) -> Result<(), Error> {
        let visitor = CollectingVisitor::new(metadata);
        for root in roots {
            iterate_node(blocks, *root, &visitor).await?;
        }
        self.commit_rows(visitor.into_rows()).await
    }

    /// Like [SqlUnixFsIndex::add_roots] for a single root, but
    /// re-entering the traversal at every directory target, so a whole
    /// tree is indexed from its top root.
    #[instrument(skip_all, fields(root = %root), err)]
    pub async fn add_root_recursive(
        &self,
        root: Cid,
        metadata: &[u8],
        blocks: &dyn BlockService,
    ) -> Result<(), Error> {
        let visitor = CollectingVisitor::new(metadata);
        let recursive = RecursiveVisitor::new(&visitor, blocks);
        iterate_node(blocks, root, &recursive).await?;
        self.commit_rows(visitor.into_rows()).await
    }

    async fn commit_rows(&self, rows: Rows) -> Result<(), Error> {
        let conn = self.conn.lock().await;
        let tx = TransactionGuard::begin(&conn)?;
        for root in &rows.roots {
            insert_root_cid_conn(&conn, root)?;
        }
        for dir_link in &rows.dir_links {
            insert_dir_link_conn(&conn, dir_link)?;
        }
        for file_link in &rows.file_links {
            insert_file_link_conn(&conn, file_link)?;
        }
        tx.commit()
    }

    pub async fn insert_root_cid(&self, root: &RootCid) -> Result<(), Error> {
        let conn = self.conn.lock().await;
        insert_root_cid_conn(&conn, root)
    }

    pub async fn insert_dir_link(&self, dir_link: &DirLink) -> Result<(), Error> {
        let conn = self.conn.lock().await;
        insert_dir_link_conn(&conn, dir_link)
    }

    pub async fn insert_file_link(&self, file_link: &FileLink) -> Result<(), Error> {
        let conn = self.conn.lock().await;
        insert_file_link_conn(&conn, file_link)
    }

    /// All index entries for a CID, newest import first.
    pub async fn root_cid(&self, root: Cid) -> Result<Vec<RootCid>, Error> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT Kind, Metadata FROM RootCIDs WHERE CID = ?1 ORDER BY rowid DESC")?;
        let rows = stmt.query_map(params![root.to_bytes()], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (kind, metadata) = row?;
            out.push(RootCid {
                cid: root,
                kind: NodeKind::try_from(kind)?,
                metadata,
            });
        }
        Ok(out)
    }

    /// The single entry for `(cid, metadata)`, or `None`.
    pub async fn root_cid_with_metadata(
        &self,
        root: Cid,
        metadata: &[u8],
    ) -> Result<Option<RootCid>, Error> {
        let conn = self.conn.lock().await;
        let kind = conn
            .query_row(
                "SELECT Kind FROM RootCIDs WHERE CID = ?1 AND Metadata = ?2 LIMIT 1",
                params![root.to_bytes(), metadata],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        match kind {
            None => Ok(None),
            Some(kind) => Ok(Some(RootCid {
                cid: root,
                kind: NodeKind::try_from(kind)?,
                metadata: metadata.to_vec(),
            })),
        }
    }

    /// The block chain resolving `sub_path` from `root`, in ascending
    /// depth; the last element is the resolved target. Empty means no
    /// such label.
    pub async fn dir_path(
        &self,
        root: Cid,
        metadata: &[u8],
        sub_path: &str,
    ) -> Result<Vec<Cid>, Error> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT CID, Depth FROM DirLinks
             WHERE RootCID = ?1 AND Metadata = ?2 AND SubPath = ?3
             ORDER BY Depth ASC",
        )?;
        let rows = stmt.query_map(params![root.to_bytes(), metadata, sub_path], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(cid_from_blob(row?)?);
        }
        Ok(out)
    }

    /// The distinct CIDs seen under `root`, layered by depth.
    pub async fn dir_ls(
        &self,
        root: Cid,
        metadata: &[u8],
    ) -> Result<Vec<Vec<TraversedCid>>, Error> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT CID, Depth, Leaf FROM DirLinks
             WHERE RootCID = ?1 AND Metadata = ?2
             ORDER BY Depth ASC",
        )?;
        let rows = stmt.query_map(params![root.to_bytes(), metadata], traversed_row)?;
        collect_layers(rows)
    }

    /// Every block of the file at `root`, layered by depth.
    pub async fn file_all(
        &self,
        root: Cid,
        metadata: &[u8],
    ) -> Result<Vec<Vec<TraversedCid>>, Error> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT CID, Depth, Leaf FROM FileLinks
             WHERE RootCID = ?1 AND Metadata = ?2
             ORDER BY Depth ASC",
        )?;
        let rows = stmt.query_map(params![root.to_bytes(), metadata], traversed_row)?;
        collect_layers(rows)
    }

    /// Like [SqlUnixFsIndex::file_all], restricted to blocks whose
    /// byte range overlaps `[byte_min, byte_max)`.
    pub async fn file_byte_range(
        &self,
        root: Cid,
        metadata: &[u8],
        byte_min: u64,
        byte_max: u64,
    ) -> Result<Vec<Vec<TraversedCid>>, Error> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT CID, Depth, Leaf FROM FileLinks
             WHERE RootCID = ?1 AND Metadata = ?2 AND ByteMin < ?3 AND ByteMax > ?4
             ORDER BY Depth ASC",
        )?;
        let rows = stmt.query_map(
            params![
                root.to_bytes(),
                metadata,
                i64::try_from(byte_max).unwrap_or(i64::MAX),
                i64::try_from(byte_min).unwrap_or(i64::MAX)
            ],
            traversed_row,
        )?;
        collect_layers(rows)
    }
}

fn insert_root_cid_conn(conn: &Connection, root: &RootCid) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO RootCIDs (CID, Kind, Metadata) VALUES (?1, ?2, ?3)",
        params![root.cid.to_bytes(), root.kind.as_i64(), root.metadata],
    )?;
    Ok(())
}

fn insert_dir_link_conn(conn: &Connection, dir_link: &DirLink) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO DirLinks (RootCID, Metadata, CID, Depth, Leaf, SubPath)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            dir_link.root_cid.to_bytes(),
            dir_link.metadata,
            dir_link.cid.to_bytes(),
            i64::try_from(dir_link.depth).unwrap_or(i64::MAX),
            dir_link.leaf,
            dir_link.sub_path
        ],
    )?;
    Ok(())
}

fn insert_file_link_conn(conn: &Connection, file_link: &FileLink) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO FileLinks (RootCID, Metadata, CID, Depth, Leaf, ByteMin, ByteMax)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            file_link.root_cid.to_bytes(),
            file_link.metadata,
            file_link.cid.to_bytes(),
            i64::try_from(file_link.depth).unwrap_or(i64::MAX),
            file_link.leaf,
            i64::try_from(file_link.byte_min).unwrap_or(i64::MAX),
            i64::try_from(file_link.byte_max).unwrap_or(i64::MAX)
        ],
    )?;
    Ok(())
}

fn cid_from_blob(blob: Vec<u8>) -> Result<Cid, Error> {
    Cid::try_from(blob).map_err(|e| Error::Storage(format!("invalid CID in index: {e}")))
}

fn traversed_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Vec<u8>, u64, bool)> {
    let depth: i64 = row.get(1)?;
    Ok((row.get(0)?, depth as u64, row.get(2)?))
}

fn collect_layers(
    rows: impl Iterator<Item = rusqlite::Result<(Vec<u8>, u64, bool)>>,
) -> Result<Vec<Vec<TraversedCid>>, Error> {
    let mut layers: Vec<Vec<TraversedCid>> = Vec::new();
    for row in rows {
        let (blob, depth, is_leaf) = row?;
        let cid = cid_from_blob(blob)?;
        while layers.len() <= depth as usize {
            layers.push(Vec::new());
        }
        layers[depth as usize].push(TraversedCid { cid, is_leaf });
    }
    Ok(layers)
}

/// An IMMEDIATE transaction that rolls back unless committed.
struct TransactionGuard<'a> {
    conn: &'a Connection,
    committed: bool,
}

impl<'a> TransactionGuard<'a> {
    fn begin(conn: &'a Connection) -> Result<Self, Error> {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Self {
            conn,
            committed: false,
        })
    }

    fn commit(mut self) -> Result<(), Error> {
        self.conn.execute_batch("COMMIT")?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

#[derive(Default)]
struct Rows {
    roots: Vec<RootCid>,
    dir_links: Vec<DirLink>,
    file_links: Vec<FileLink>,
}

/// Buffers traversal events as index rows, to be written in one
/// transaction once the walk completes.
struct CollectingVisitor<'a> {
    metadata: &'a [u8],
    rows: StdMutex<Rows>,
}

impl<'a> CollectingVisitor<'a> {
    fn new(metadata: &'a [u8]) -> Self {
        Self {
            metadata,
            rows: StdMutex::new(Rows::default()),
        }
    }

    fn into_rows(self) -> Rows {
        self.rows.into_inner().expect("lock poisoned")
    }
}

#[async_trait]
impl UnixFsVisitor for CollectingVisitor<'_> {
    async fn on_root(&self, root: Cid, kind: NodeKind) -> Result<(), CastoreError> {
        self.rows.lock().expect("lock poisoned").roots.push(RootCid {
            cid: root,
            kind,
            metadata: self.metadata.to_vec(),
        });
        Ok(())
    }

    async fn on_path(&self, root: Cid, label: &str, chain: &[Cid]) -> Result<(), CastoreError> {
        let mut rows = self.rows.lock().expect("lock poisoned");
        for (depth, cid) in chain.iter().enumerate() {
            rows.dir_links.push(DirLink {
                root_cid: root,
                metadata: self.metadata.to_vec(),
                cid: *cid,
                depth: depth as u64,
                leaf: depth == chain.len() - 1,
                sub_path: label.to_string(),
            });
        }
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
    ) -> Result<(), CastoreError> {
        self.rows.lock().expect("lock poisoned").file_links.push(FileLink {
            root_cid: root,
            metadata: self.metadata.to_vec(),
            cid,
            depth,
            leaf,
            byte_min,
            byte_max,
        });
        Ok(())
    }
}
