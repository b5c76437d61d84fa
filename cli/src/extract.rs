//! Materialises a fetched sub-DAG onto the filesystem.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use cid::Cid;
use futures::future::BoxFuture;

use stargate_castore::blockservice::{self, BlockService};
use stargate_castore::cids::RAW_CODEC;
use stargate_castore::proto::{
    classify_hamt_link, hamt_pad_length, LinkClass, NodeKind, PbNode, UnixfsData,
};

/// Write the DAG at `root` under `output_dir`: directory roots become
/// trees; file and raw roots are written as a file named `unknown`.
pub async fn extract_root(
    blocks: &dyn BlockService,
    root: Cid,
    output_dir: &Path,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;
    if root.codec() == RAW_CODEC {
        let data = blockservice::require(blocks, &root).await?;
        std::fs::write(output_dir.join("unknown"), &data)?;
        return Ok(());
    }
    let (node, ufs) = load_node(blocks, &root).await?;
    match ufs.kind()? {
        NodeKind::Directory | NodeKind::HamtShard => {
            extract_dir(blocks, node, ufs, output_dir.to_path_buf()).await
        }
        NodeKind::File | NodeKind::Raw => {
            let contents = read_file_bytes(blocks, node, ufs).await?;
            std::fs::write(output_dir.join("unknown"), contents)?;
            Ok(())
        }
        other => bail!("cannot extract node of type {}", other.as_i64()),
    }
}

async fn load_node(blocks: &dyn BlockService, cid: &Cid) -> anyhow::Result<(PbNode, UnixfsData)> {
    let data = blockservice::require(blocks, cid).await?;
    let node = PbNode::from_bytes(&data)?;
    let ufs = UnixfsData::from_node(&node)?;
    Ok((node, ufs))
}

/// A directory's visible entries, descending through HAMT shards.
fn dir_entries<'a>(
    blocks: &'a dyn BlockService,
    node: PbNode,
    ufs: UnixfsData,
) -> BoxFuture<'a, anyhow::Result<Vec<(String, Cid)>>> {
    Box::pin(async move {
        let mut entries = Vec::new();
        match ufs.kind()? {
            NodeKind::Directory => {
                for link in &node.links {
                    let name = link
                        .name
                        .clone()
                        .ok_or_else(|| anyhow::anyhow!("directory entry without a name"))?;
                    entries.push((name, link.cid()?));
                }
            }
            NodeKind::HamtShard => {
                let pad_length = hamt_pad_length(&ufs)?;
                for link in &node.links {
                    let child = link.cid()?;
                    match classify_hamt_link(link, pad_length)? {
                        LinkClass::ValueEntry => {
                            let name = link.name.as_deref().unwrap_or_default();
                            let label = name
                                .get(pad_length..)
                                .with_context(|| format!("invalid link name {name:?}"))?;
                            entries.push((label.to_string(), child));
                        }
                        LinkClass::ShardPointer => {
                            let (child_node, child_ufs) = load_node(blocks, &child).await?;
                            entries.extend(dir_entries(blocks, child_node, child_ufs).await?);
                        }
                    }
                }
            }
            other => bail!("not a directory: type {}", other.as_i64()),
        }
        Ok(entries)
    })
}

fn extract_dir<'a>(
    blocks: &'a dyn BlockService,
    node: PbNode,
    ufs: UnixfsData,
    dir_path: PathBuf,
) -> BoxFuture<'a, anyhow::Result<()>> {
    Box::pin(async move {
        std::fs::create_dir_all(&dir_path)?;
        for (name, child) in dir_entries(blocks, node, ufs).await? {
            // entry names come from the DAG; never let one escape the
            // output directory
            if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                bail!("refusing to extract suspicious entry name {name:?}");
            }
            let child_path = dir_path.join(&name);
            if child.codec() == RAW_CODEC {
                let data = blockservice::require(blocks, &child).await?;
                std::fs::write(&child_path, &data)?;
                continue;
            }
            let (child_node, child_ufs) = load_node(blocks, &child).await?;
            match child_ufs.kind()? {
                NodeKind::Directory | NodeKind::HamtShard => {
                    extract_dir(blocks, child_node, child_ufs, child_path).await?;
                }
                NodeKind::File | NodeKind::Raw => {
                    let contents = read_file_bytes(blocks, child_node, child_ufs).await?;
                    std::fs::write(&child_path, contents)?;
                }
                NodeKind::Symlink => {
                    let target = child_ufs.data.clone().unwrap_or_default();
                    let target =
                        std::str::from_utf8(&target).context("symlink target is not UTF-8")?;
                    std::os::unix::fs::symlink(target, &child_path)?;
                }
                NodeKind::Metadata => bail!("cannot extract metadata node {child}"),
            }
        }
        Ok(())
    })
}

/// Reassemble a file's bytes by walking its links in order.
fn read_file_bytes<'a>(
    blocks: &'a dyn BlockService,
    node: PbNode,
    ufs: UnixfsData,
) -> BoxFuture<'a, anyhow::Result<Vec<u8>>> {
    Box::pin(async move {
        // small files may carry their bytes inline on the node itself
        let mut contents = ufs.data.as_deref().unwrap_or_default().to_vec();
        for link in &node.links {
            let child = link.cid()?;
            if child.codec() == RAW_CODEC {
                contents.extend_from_slice(&blockservice::require(blocks, &child).await?);
                continue;
            }
            let (child_node, child_ufs) = load_node(blocks, &child).await?;
            match child_ufs.kind()? {
                NodeKind::File | NodeKind::Raw => {
                    contents.extend(read_file_bytes(blocks, child_node, child_ufs).await?);
                }
                other => bail!("unexpected node type {} inside a file", other.as_i64()),
            }
        }
        Ok(contents)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stargate_castore::fixtures::{hamt_fixture, nested_tree_fixture};

    #[tokio::test]
    async fn extracts_a_directory_tree() {
        let (blocks, tree) = nested_tree_fixture();
        let out = tempfile::TempDir::new().unwrap();

        extract_root(&blocks, tree.root, out.path()).await.unwrap();

        let file_path = out.path().join("subfolder/file.txt");
        let contents = std::fs::read(&file_path).unwrap();
        // the fixture file is two 8-byte chunks seeded 0x40
        let mut expected = vec![0x40u8; 8];
        expected.extend(vec![0x41u8; 8]);
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn extracts_hamt_entries_with_clean_names() {
        let (blocks, hamt) = hamt_fixture();
        let out = tempfile::TempDir::new().unwrap();

        extract_root(&blocks, hamt.root, out.path()).await.unwrap();

        assert_eq!(
            std::fs::read(out.path().join("top.txt")).unwrap(),
            b"top value"
        );
        assert_eq!(
            std::fs::read(out.path().join("nested.txt")).unwrap(),
            b"nested value"
        );
    }

    #[tokio::test]
    async fn extracts_a_bare_file_as_unknown() {
        let (blocks, tree) = nested_tree_fixture();
        let out = tempfile::TempDir::new().unwrap();

        extract_root(&blocks, tree.file.root, out.path()).await.unwrap();

        assert!(out.path().join("unknown").is_file());
    }
}
