//! Cache backend abstraction.
//!
//! Backends implement the three store operations of two-phase caching. All
//! operations are asynchronous, cancellable, and idempotent where the
//! contract requires it (publication by `(weak, pathSetHash, strong)`).

use std::future::Future;

use color_eyre::Result;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    hash::{ContentHash, PathSetHash, StrongFingerprint, WeakFingerprint},
    observe::pathset::ObservedPathSet,
};

/// One produced output in a cache metadata record. Paths are stored
/// expanded so records survive across processes.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct OutputRecord {
    pub path: String,
    pub hash: ContentHash,
    pub length: u64,
}

/// The replayable result of a prior execution.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub strong_fingerprint: StrongFingerprint,
    pub semi_stable_hash: u64,
    pub outputs: Vec<OutputRecord>,
}

/// Storage contract for two-phase cache lookup.
pub trait CacheBackend: Clone + Send + Sync + 'static {
    /// Stream up to `max_results` prior path sets recorded under the weak
    /// fingerprint, most recent first.
    fn query_path_sets(
        &self,
        weak: &WeakFingerprint,
        max_results: usize,
        cancel: &CancellationToken,
    ) -> impl Future<
        Output = Result<impl Stream<Item = Result<(PathSetHash, ObservedPathSet)>> + Send + Unpin>,
    > + Send;

    /// Fetch the metadata recorded under the exact strong fingerprint, if
    /// any.
    fn query_strong_fingerprint(
        &self,
        weak: &WeakFingerprint,
        path_set_hash: &PathSetHash,
        strong: &StrongFingerprint,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Option<CacheMetadata>>> + Send;

    /// Record a `(path set, strong fingerprint, metadata)` triple.
    /// Publishing the same triple twice is a no-op.
    fn publish(
        &self,
        weak: &WeakFingerprint,
        path_set: &ObservedPathSet,
        metadata: &CacheMetadata,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send;
}
