use std::path::Path;

use anyhow::{bail, Context};

use stargate_castore::blockservice::{CarBlockService, CarFileWriter, MemoryBlockService};
use stargate_castore::import::ingest_path;
use stargate_castore::roots::discover_roots;
use stargate_store::index::SqlUnixFsIndex;

use crate::repo::Repo;

pub async fn run(repo: &Repo, path: &Path, chunk_size: usize) -> anyhow::Result<()> {
    repo.ensure()?;
    let index = repo.open_index()?;

    let src = std::fs::canonicalize(path)
        .with_context(|| format!("resolving source path {}", path.display()))?;

    // build the DAG in a staging store first, so the CAR can be
    // written in one pass with its root already known
    let staging = MemoryBlockService::default();
    let root = ingest_path(&staging, &src, chunk_size)
        .await
        .context("importing data")?;

    let car_path = repo.carstore_dir().join(format!("{root}.car"));
    if car_path.exists() {
        bail!("file or directory already imported");
    }

    let tmp = tempfile::Builder::new()
        .prefix("stargate-tmp-")
        .tempfile_in(repo.carstore_dir())
        .context("creating temporary CAR")?;
    let file = tokio::fs::File::from_std(tmp.reopen().context("opening temporary CAR")?);
    let mut writer = CarFileWriter::open(file, vec![root])
        .await
        .context("writing CAR header")?;
    for block in staging.blocks_in_order() {
        writer.put(&block).await.context("writing CAR block")?;
    }
    writer.finish().await.context("finalizing CAR")?;
    tmp.persist(&car_path).context("moving CAR into place")?;

    // index everything in the new CAR; on failure remove it so a bad
    // import leaves neither file nor rows behind
    if let Err(e) = index_car(&index, &car_path).await {
        let _ = std::fs::remove_file(&car_path);
        return Err(e.context("indexing the imported data"));
    }

    println!("Sending CID {root} through the Stargate!");
    Ok(())
}

async fn index_car(index: &SqlUnixFsIndex, car_path: &Path) -> anyhow::Result<()> {
    let car_path = std::fs::canonicalize(car_path).context("resolving CAR path")?;
    let store = CarBlockService::open(&car_path).await?;
    let roots = discover_roots(&store).await?;
    let metadata = car_path
        .to_str()
        .context("car path is not valid UTF-8")?
        .as_bytes();
    index.add_roots(&roots, metadata, &store).await?;
    Ok(())
}
