//! Composes a complete StarGate response as a CAR v1 stream: the
//! header, then path messages for the URL path, then the DAG messages
//! for the query, each message followed by its `Present` block bodies.

use cid::Cid;
use tokio::io::AsyncWrite;
use tracing::instrument;

use stargate_castore::blockservice::{self, BlockService};
use stargate_castore::carv1::{self, CarHeader};

use crate::messages::{BlockStatus, StarGateMessage};
use crate::resolver::{AppResolver, PathSegments, Query};
use crate::Error;

#[instrument(skip(w, app_resolver), err)]
pub async fn write_car<W>(
    w: &mut W,
    root: Cid,
    segments: PathSegments,
    query: Query,
    app_resolver: &dyn AppResolver,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + Send,
{
    carv1::write_header(w, &CarHeader::new(vec![root])).await?;

    let (blocks, mut resolver) = app_resolver.get_resolver(root).await?;

    let mut remaining = segments;
    while !remaining.is_empty() {
        let (path, rest, next) = resolver.resolve_path_segments(&remaining).await?;
        remaining = rest;
        resolver = next;
        write_message_and_blocks(w, &StarGateMessage::path(path), blocks.as_ref()).await?;
    }

    let mut query_resolver = resolver.resolve_query(&query).await?;
    while !query_resolver.done() {
        let dag = query_resolver.next().await?;
        write_message_and_blocks(w, &StarGateMessage::dag(dag), blocks.as_ref()).await?;
    }
    Ok(())
}

/// Frame one message, then stream the body of every `Present` entry in
/// metadata order.
async fn write_message_and_blocks<W>(
    w: &mut W,
    message: &StarGateMessage,
    blocks: &dyn BlockService,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + Send,
{
    let (message_cid, raw) = message.encode()?;
    carv1::write_block(w, &message_cid, &raw).await?;
    for metadatum in message.blocks() {
        if metadatum.status == BlockStatus::Present {
            let data = blockservice::require(blocks, &metadatum.link).await?;
            carv1::write_block(w, &metadatum.link, &data).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use stargate_castore::blockservice::MemoryBlockService;
    use stargate_castore::cids;
    use stargate_castore::fixtures::nested_tree_fixture;
    use stargate_castore::roots::discover_roots;

    use crate::index::SqlUnixFsIndex;
    use crate::messages::MessageKind;
    use crate::resolver::{BlockSourceOpener, UnixFsAppResolver};

    struct FixedOpener(Arc<MemoryBlockService>);

    #[async_trait]
    impl BlockSourceOpener for FixedOpener {
        async fn open(
            &self,
            _root: &Cid,
            _metadata: &[u8],
        ) -> Result<Arc<dyn BlockService>, Error> {
            Ok(self.0.clone())
        }
    }

    async fn app_for(blocks: MemoryBlockService) -> UnixFsAppResolver {
        let index = Arc::new(SqlUnixFsIndex::open_in_memory().unwrap());
        let roots = discover_roots(&blocks).await.unwrap();
        index.add_roots(&roots, b"fixture.car", &blocks).await.unwrap();
        UnixFsAppResolver::new(index, Arc::new(FixedOpener(Arc::new(blocks))))
    }

    /// Parse a finished stream back into `(message, bodies)` frames.
    async fn parse_response(raw: &[u8], root: Cid) -> Vec<(StarGateMessage, Vec<Cid>)> {
        let mut r = std::io::Cursor::new(raw);
        let header = carv1::read_header(&mut r).await.unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.roots, vec![root]);

        let mut frames = Vec::new();
        while let Some((message_cid, message_raw)) = carv1::read_block(&mut r).await.unwrap() {
            assert_eq!(message_cid.codec(), cids::DAG_CBOR_CODEC);
            assert!(cids::verify(&message_cid, &message_raw));
            let message = StarGateMessage::decode(&message_raw).unwrap();

            let mut bodies = Vec::new();
            for metadatum in message.blocks() {
                if metadatum.status == BlockStatus::Present {
                    let (cid, data) = carv1::read_block(&mut r).await.unwrap().unwrap();
                    assert_eq!(cid, metadatum.link);
                    assert!(cids::verify(&cid, &data));
                    bodies.push(cid);
                }
            }
            frames.push((message, bodies));
        }
        frames
    }

    #[tokio::test]
    async fn response_frames_match_present_counts() {
        let (blocks, tree) = nested_tree_fixture();
        let app = app_for(blocks).await;

        let mut buf = Vec::new();
        write_car(
            &mut buf,
            tree.root,
            vec!["subfolder".to_string(), "file.txt".to_string()],
            Query::default(),
            &app,
        )
        .await
        .unwrap();

        let frames = parse_response(&buf, tree.root).await;
        assert_eq!(frames.len(), 2);

        // one path message covering both segments, then one DAG message
        let (path_message, _) = &frames[0];
        assert_eq!(path_message.kind, MessageKind::Path);
        assert_eq!(
            path_message.path.as_ref().unwrap().segments,
            vec!["subfolder".to_string(), "file.txt".to_string()]
        );

        let (dag_message, bodies) = &frames[1];
        assert_eq!(dag_message.kind, MessageKind::Dag);
        // root plus the two file leaves
        assert_eq!(bodies.len(), 3);
        assert_eq!(bodies[0], tree.file.root);
        assert_eq!(&bodies[1..], &tree.file.leaves[..]);
    }

    #[tokio::test]
    async fn serving_is_idempotent() {
        let (blocks, tree) = nested_tree_fixture();
        let app = app_for(blocks).await;

        let mut first = Vec::new();
        write_car(
            &mut first,
            tree.root,
            vec!["subfolder".to_string()],
            Query::default(),
            &app,
        )
        .await
        .unwrap();

        let mut second = Vec::new();
        write_car(
            &mut second,
            tree.root,
            vec!["subfolder".to_string()],
            Query::default(),
            &app,
        )
        .await
        .unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn path_error_aborts_the_response() {
        let (blocks, tree) = nested_tree_fixture();
        let app = app_for(blocks).await;

        let mut buf = Vec::new();
        let err = write_car(
            &mut buf,
            tree.root,
            vec!["does-not-exist".to_string()],
            Query::default(),
            &app,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Path { .. }));
    }

    #[tokio::test]
    async fn unknown_root_aborts_the_response() {
        let (blocks, _) = nested_tree_fixture();
        let app = app_for(blocks).await;
        let absent = cids::cid_sha2_256(cids::RAW_CODEC, b"absent");

        let mut buf = Vec::new();
        let err = write_car(&mut buf, absent, Vec::new(), Query::default(), &app)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
