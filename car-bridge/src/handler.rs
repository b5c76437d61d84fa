use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use cid::Cid;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{info, instrument, warn};

use stargate_store::carwriter::write_car;
use stargate_store::resolver::Query;
use stargate_store::Error;

use crate::AppState;

const CONTENT_TYPE: &str = "application/vnd.ipld.car+stargate";

/// The served data is immutable (identified by CID), so the
/// Last-Modified header is a constant: epoch plus one millisecond.
const LAST_MODIFIED: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

#[instrument(skip(state, raw_query))]
pub(crate) async fn serve(
    Path((app, rest)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    State(state): State<AppState>,
) -> Response {
    let Some(app_resolver) = state.apps.get(&app) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("incorrect prefix: no app registered at /{app}/"),
        );
    };

    let mut parts = rest.split('/');
    let cid_string = parts.next().unwrap_or_default();
    let segments: Vec<String> = parts.map(str::to_owned).collect();
    if cid_string.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("path '/{app}/{rest}' is missing CID"),
        );
    }
    let root = match Cid::try_from(cid_string) {
        Ok(root) => root,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("parsing CID '{cid_string}': {e}"),
            );
        }
    };
    let query = parse_query(raw_query.as_deref());

    // compose the whole response before sending any bytes; the file is
    // anonymous, so it is gone on every exit path
    let buffer = match tempfile::tempfile() {
        Ok(file) => file,
        Err(e) => {
            warn!(err = %e, "unable to create response buffer");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "error setting up response".to_string(),
            );
        }
    };
    let mut buffer = tokio::fs::File::from_std(buffer);

    if let Err(e) = write_car(&mut buffer, root, segments, query, app_resolver.as_ref()).await {
        let status = match &e {
            Error::NotFound(_) | Error::Path { .. } => StatusCode::NOT_FOUND,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        return error_response(status, e.to_string());
    }
    if let Err(e) = buffer.flush().await {
        warn!(err = %e, "unable to flush response buffer");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "error writing response".to_string(),
        );
    }

    let length = match buffer.metadata().await {
        Ok(metadata) => metadata.len(),
        Err(e) => {
            warn!(err = %e, "unable to stat response buffer");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "error reading back response".to_string(),
            );
        }
    };
    if let Err(e) = buffer.seek(std::io::SeekFrom::Start(0)).await {
        warn!(err = %e, "unable to rewind response buffer");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "error reading back response".to_string(),
        );
    }

    info!(%root, length, "serving car response");
    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, CONTENT_TYPE)
        .header(header::CONTENT_LENGTH, length)
        .header(header::LAST_MODIFIED, LAST_MODIFIED)
        .body(Body::from_stream(ReaderStream::new(buffer)))
    {
        Ok(response) => response,
        Err(e) => {
            warn!(err = %e, "unable to build response");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "error building response".to_string(),
            )
        }
    }
}

/// Anything the app route does not match: a registered prefix with no
/// CID is a client error, everything else is plain not-found.
pub(crate) async fn fallback(
    State(state): State<AppState>,
    uri: axum::http::Uri,
) -> Response {
    let path = uri.path();
    let prefix = path.trim_matches('/');
    if state.apps.contains_key(prefix) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("path '{path}' is missing CID"),
        );
    }
    error_response(StatusCode::NOT_FOUND, format!("no handler for '{path}'"))
}

fn parse_query(raw_query: Option<&str>) -> Query {
    match raw_query {
        None => Query::default(),
        Some(raw) => Query::from_pairs(
            url::form_urlencoded::parse(raw.as_bytes())
                .map(|(key, value)| (key.into_owned(), value.into_owned())),
        ),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    warn!(%status, message, "request failed");
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(format!("Error: {message}")))
        .unwrap()
}
