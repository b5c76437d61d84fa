//! Resolver seams: an app turns `(root, path, query)` into a sequence
//! of StarGate messages backed by a block source.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;

use stargate_castore::blockservice::BlockService;

use crate::messages::{DagMessage, PathMessage};
use crate::Error;

mod unixfs;
pub use unixfs::{BlockSourceOpener, UnixFsAppResolver, UnixFsPathResolver};

/// The path segments of a request URL, in order.
pub type PathSegments = Vec<String>;

/// A parsed URL query: key to values, in appearance order.
#[derive(Debug, Clone, Default)]
pub struct Query(HashMap<String, Vec<String>>);

impl Query {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for (key, value) in pairs {
            map.entry(key.into()).or_default().push(value.into());
        }
        Self(map)
    }

    /// The first value for `key`, if any.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|values| values.first()).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }
}

/// Finds the root of a DAG and returns the block source to serve it
/// from, plus a resolver for the rest of the request.
#[async_trait]
pub trait AppResolver: Send + Sync {
    async fn get_resolver(
        &self,
        root: Cid,
    ) -> Result<(Arc<dyn BlockService>, Box<dyn PathResolver>), Error>;
}

impl std::fmt::Debug for dyn PathResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn PathResolver")
    }
}

/// Resolves the URL path.
#[async_trait]
pub trait PathResolver: Send + Sync {
    /// Resolve at least one path segment. On success returns the path
    /// message describing the resolution, any unresolved segments, and
    /// a resolver rooted at the end of the resolved portion.
    async fn resolve_path_segments(
        &self,
        segments: &[String],
    ) -> Result<(PathMessage, PathSegments, Box<dyn PathResolver>), Error>;

    /// A resolver for the query at the end of the path.
    async fn resolve_query(&self, query: &Query) -> Result<Box<dyn QueryResolver>, Error>;
}

/// Produces the DAG messages fulfilling a request after path
/// resolution.
#[async_trait]
pub trait QueryResolver: Send {
    /// The next message. Pulling past the last message is
    /// [Error::NoMoreMessages].
    async fn next(&mut self) -> Result<DagMessage, Error>;

    /// Whether every message has been produced.
    fn done(&self) -> bool;
}
