use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use cid::Cid;
use tracing::{info, warn};

use car_bridge::gen_router;
use stargate_castore::blockservice::{BlockService, CarBlockService};
use stargate_store::resolver::{AppResolver, BlockSourceOpener, UnixFsAppResolver};
use stargate_store::Error;

use crate::repo::Repo;

/// Opens the CAR file named by a root's provenance metadata.
struct CarFileOpener;

#[async_trait]
impl BlockSourceOpener for CarFileOpener {
    async fn open(&self, _root: &Cid, metadata: &[u8]) -> Result<Arc<dyn BlockService>, Error> {
        let path = std::str::from_utf8(metadata)
            .map_err(|_| Error::Storage("car path metadata is not valid UTF-8".to_string()))?;
        let store = CarBlockService::open(path).await?;
        Ok(Arc::new(store))
    }
}

pub async fn run(repo: &Repo, port: u16) -> anyhow::Result<()> {
    repo.ensure()?;
    let index = Arc::new(repo.open_index()?);
    let app = UnixFsAppResolver::new(index, Arc::new(CarFileOpener));

    let mut apps: HashMap<String, Arc<dyn AppResolver>> = HashMap::new();
    apps.insert("ipfs".to_string(), Arc::new(app));
    let router = gen_router(apps);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "opening a stargate");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;
    info!("graceful shutdown successful");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(err = %e, "unable to listen for the shutdown signal");
        return;
    }
    info!("shutting down stargate");
}
