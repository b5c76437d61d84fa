use std::path::Path;

use anyhow::{bail, Context};
use futures::TryStreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use stargate_castore::blockservice::{Block, BlockSink, MemoryBlockService};
use stargate_castore::carv1;
use stargate_castore::cids;
use stargate_store::messages::{BlockStatus, MessageKind, StarGateMessage};

use crate::extract;

pub async fn run(url: &str, output_dir: &Path) -> anyhow::Result<()> {
    let response = reqwest::get(url).await.context("executing request")?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("response error: status code: {status}, message: {body}");
    }
    let stream = response.bytes_stream().map_err(std::io::Error::other);
    let mut reader = StreamReader::new(stream);
    consume_stream(&mut reader, output_dir).await
}

/// Decode a StarGate CAR stream, verifying every block against its
/// CID, and extract the resolved target into `output_dir`.
async fn consume_stream<R>(reader: &mut R, output_dir: &Path) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    carv1::read_header(reader)
        .await
        .context("parsing response header")?;

    let blocks = MemoryBlockService::default();
    while let Some((message_cid, raw)) = carv1::read_block(reader)
        .await
        .context("parsing response")?
    {
        if !cids::verify(&message_cid, &raw) {
            bail!("message {message_cid} failed verification");
        }
        let message = StarGateMessage::decode(&raw).context("parsing stargate message")?;

        // every Present entry is followed by its body, in order; each
        // body must hash to the CID the metadata promised
        for metadatum in message.blocks() {
            if metadatum.status != BlockStatus::Present {
                continue;
            }
            let (cid, data) = carv1::read_block(reader)
                .await
                .context("parsing block record")?
                .context("response truncated inside a message's blocks")?;
            if cid != metadatum.link {
                bail!("unexpected block: expected {}, got {cid}", metadatum.link);
            }
            if !cids::verify(&cid, &data) {
                bail!("block {cid} failed verification");
            }
            blocks.put(Block { cid, data }).await?;
        }

        if message.kind == MessageKind::Dag {
            // the DAG message's first entry is the resolved target of
            // the request path
            let Some(target) = message.blocks().first().map(|b| b.link) else {
                bail!("empty DAG message");
            };
            extract::extract_root(&blocks, target, output_dir).await?;
            println!("Extracted {target} into {}", output_dir.display());
            return Ok(());
        }
    }
    bail!("response ended before a DAG message")
}
