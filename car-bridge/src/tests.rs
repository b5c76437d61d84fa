use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use cid::Cid;
use http_body_util::BodyExt;
use tower::ServiceExt;

use stargate_castore::blockservice::{BlockService, MemoryBlockService};
use stargate_castore::carv1;
use stargate_castore::fixtures::{nested_tree_fixture, TreeFixture};
use stargate_castore::roots::discover_roots;
use stargate_store::index::SqlUnixFsIndex;
use stargate_store::messages::{BlockStatus, MessageKind, StarGateMessage};
use stargate_store::resolver::{AppResolver, BlockSourceOpener, UnixFsAppResolver};
use stargate_store::Error;

use crate::gen_router;

struct FixedOpener(Arc<MemoryBlockService>);

#[async_trait]
impl BlockSourceOpener for FixedOpener {
    async fn open(&self, _root: &Cid, _metadata: &[u8]) -> Result<Arc<dyn BlockService>, Error> {
        Ok(self.0.clone())
    }
}

async fn router_for(blocks: MemoryBlockService) -> Router {
    let index = Arc::new(SqlUnixFsIndex::open_in_memory().unwrap());
    let roots = discover_roots(&blocks).await.unwrap();
    index.add_roots(&roots, b"fixture.car", &blocks).await.unwrap();
    let app = UnixFsAppResolver::new(index, Arc::new(FixedOpener(Arc::new(blocks))));

    let mut apps: HashMap<String, Arc<dyn AppResolver>> = HashMap::new();
    apps.insert("ipfs".to_string(), Arc::new(app));
    gen_router(apps)
}

async fn fixture_router() -> (Router, TreeFixture) {
    let (blocks, tree) = nested_tree_fixture();
    (router_for(blocks).await, tree)
}

async fn get(router: Router, uri: &str) -> (StatusCode, Bytes) {
    let response = router
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

#[tokio::test]
async fn serves_a_complete_car_stream() {
    let (router, tree) = fixture_router().await;

    let uri = format!("/ipfs/{}/subfolder/file.txt", tree.root);
    let response = router
        .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/vnd.ipld.car+stargate"
    );
    assert_eq!(
        response.headers()[header::LAST_MODIFIED],
        "Thu, 01 Jan 1970 00:00:00 GMT"
    );

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let mut r = std::io::Cursor::new(&body[..]);
    let car_header = carv1::read_header(&mut r).await.unwrap();
    assert_eq!(car_header.roots, vec![tree.root]);

    // path message, then DAG message, each followed by its Present
    // bodies
    let mut kinds = Vec::new();
    while let Some((_, raw)) = carv1::read_block(&mut r).await.unwrap() {
        let message = StarGateMessage::decode(&raw).unwrap();
        for metadatum in message.blocks() {
            if metadatum.status == BlockStatus::Present {
                let (cid, _) = carv1::read_block(&mut r).await.unwrap().unwrap();
                assert_eq!(cid, metadatum.link);
            }
        }
        kinds.push(message.kind);
    }
    assert_eq!(kinds, vec![MessageKind::Path, MessageKind::Dag]);
}

#[tokio::test]
async fn malformed_cid_is_a_bad_request() {
    let (router, _) = fixture_router().await;
    let (status, body) = get(router, "/ipfs/not-a-cid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.starts_with(b"Error: parsing CID 'not-a-cid'"));
}

#[tokio::test]
async fn prefix_without_cid_is_a_bad_request() {
    let (router, _) = fixture_router().await;
    let (status, body) = get(router, "/ipfs/").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.starts_with(b"Error: "), "body was {body:?}");
}

#[tokio::test]
async fn unregistered_prefix_is_rejected() {
    let (router, tree) = fixture_router().await;
    let (status, _) = get(router, &format!("/nope/{}", tree.root)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_root_is_not_found() {
    let (router, _) = fixture_router().await;
    let absent =
        stargate_castore::cids::cid_sha2_256(stargate_castore::cids::RAW_CODEC, b"absent");
    let (status, body) = get(router, &format!("/ipfs/{absent}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        body,
        Bytes::from(format!("Error: unable to find CID: {absent}"))
    );
}

#[tokio::test]
async fn missing_path_label_is_not_found_with_cause() {
    let (router, tree) = fixture_router().await;
    let (status, body) = get(router, &format!("/ipfs/{}/does-not-exist", tree.root)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        body,
        Bytes::from(format!(
            "Error: path traversal error at {}/: no file or folder does-not-exist",
            tree.root
        ))
    );
}

#[tokio::test]
async fn malformed_bytes_query_is_a_bad_request() {
    let (router, tree) = fixture_router().await;
    let uri = format!("/ipfs/{}/subfolder/file.txt?bytes=nope", tree.root);
    let (status, body) = get(router, &uri).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.starts_with(b"Error: invalid request"));
}

#[tokio::test]
async fn head_returns_headers_only_success() {
    let (router, tree) = fixture_router().await;
    let response = router
        .oneshot(
            Request::head(format!("/ipfs/{}", tree.root).as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/vnd.ipld.car+stargate"
    );
}

#[tokio::test]
async fn gzip_is_negotiated() {
    let (router, tree) = fixture_router().await;
    let response = router
        .oneshot(
            Request::get(format!("/ipfs/{}/subfolder/file.txt", tree.root).as_str())
                .header(header::ACCEPT_ENCODING, "gzip")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
}

#[tokio::test]
async fn identical_requests_serve_identical_bytes() {
    let (blocks, tree) = nested_tree_fixture();
    let router = router_for(blocks).await;
    let uri = format!("/ipfs/{}/subfolder/file.txt", tree.root);

    let (status_a, body_a) = get(router.clone(), &uri).await;
    let (status_b, body_b) = get(router, &uri).await;
    assert_eq!(status_a, StatusCode::OK);
    assert_eq!(status_b, StatusCode::OK);
    assert_eq!(body_a, body_b);
}
