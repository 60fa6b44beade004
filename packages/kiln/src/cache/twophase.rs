//! The two-phase cache lookup driver.
//!
//! For one pip: compute the weak fingerprint, fetch candidate path sets,
//! replay each candidate through the observed-input processor, derive the
//! strong fingerprint, and take the first metadata record that matches.
//! A candidate that merely fails to match is a miss; a candidate that
//! aborts typing surfaces as an error. A dead cache backend degrades to a
//! warning and a forced miss.

use std::sync::Arc;

use color_eyre::{Result, eyre::eyre};
use futures::TryStreamExt;
use tap::Pipe;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    config::EngineConfig,
    graph::PipGraph,
    hash::{FingerprintHasher, PathSetHash, StrongFingerprint, WeakFingerprint},
    observe::{
        ObservationStatus, ObservedInputProcessor, ProcessedObservations,
        env::CacheLookupEnv, strong_fingerprint,
    },
    pip::GraphPip,
};

use super::{
    backend::{CacheBackend, CacheMetadata, OutputRecord},
    fpstore::FingerprintStore,
};

/// Result of one pip's cache lookup.
#[derive(Clone, Debug)]
pub enum CacheLookupOutcome {
    /// A prior execution matches; replay its outputs.
    Hit {
        path_set_hash: PathSetHash,
        strong: StrongFingerprint,
        metadata: CacheMetadata,
    },
    /// No candidate survived; the pip must execute.
    Miss {
        weak: WeakFingerprint,
        candidates_rejected: usize,
    },
}

/// Drives both phases of cache lookup and publication for a backend.
pub struct TwoPhaseCacheLookup<B> {
    backend: B,
    processor: ObservedInputProcessor,
    graph: Arc<PipGraph>,
    config: EngineConfig,
    fingerprint_store: Option<Arc<FingerprintStore>>,
}

impl<B: CacheBackend> TwoPhaseCacheLookup<B> {
    pub fn new(
        backend: B,
        processor: ObservedInputProcessor,
        graph: Arc<PipGraph>,
        config: EngineConfig,
        fingerprint_store: Option<Arc<FingerprintStore>>,
    ) -> Self {
        Self {
            backend,
            processor,
            graph,
            config,
            fingerprint_store,
        }
    }

    /// The first-phase key: the pip's static fingerprint plus the salts and
    /// configuration bits that shape typing.
    pub fn weak_fingerprint(&self, pip: &GraphPip) -> WeakFingerprint {
        let mut hasher = FingerprintHasher::new();
        hasher.add_digest("static", pip.static_fingerprint.as_bytes());
        self.config.add_fingerprint_salts(&mut hasher);
        hasher.finish().pipe(WeakFingerprint)
    }

    /// Run both phases for one pip.
    #[instrument(skip_all, fields(pip = %pip.pip.display_name()))]
    pub async fn lookup(
        &self,
        pip: &GraphPip,
        cancel: &CancellationToken,
    ) -> Result<CacheLookupOutcome> {
        let weak = self.weak_fingerprint(pip);
        let mut candidates = match self
            .backend
            .query_path_sets(&weak, self.config.max_path_sets, cancel)
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                // The cache being unreachable costs a re-execution, never
                // the build.
                warn!(%weak, %err, "cache backend unavailable; forcing execution");
                return Ok(CacheLookupOutcome::Miss {
                    weak,
                    candidates_rejected: 0,
                });
            }
        };

        let paths = self.graph.paths();
        let mut rejected = 0usize;
        while let Some((path_set_hash, path_set)) = candidates.try_next().await? {
            let entries = match path_set.intern_entries(paths) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(%path_set_hash, %err, "stored path set does not intern; skipping");
                    rejected += 1;
                    continue;
                }
            };
            let environment = CacheLookupEnv::new(&entries, path_set.accessed_names.clone());
            let processed = self
                .processor
                .process(&environment, pip, &entries, cancel)
                .await?;
            match processed.status {
                ObservationStatus::Aborted => {
                    let detail = processed
                        .failures
                        .first()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "candidate aborted observation typing".to_owned());
                    return Err(eyre!(
                        "cache lookup aborted for {}: {detail}",
                        pip.pip.display_name()
                    ));
                }
                ObservationStatus::Mismatched => {
                    rejected += 1;
                    continue;
                }
                ObservationStatus::Success => {}
            }

            let strong =
                strong_fingerprint(paths, &weak, &path_set_hash, &processed.observations);
            match self
                .backend
                .query_strong_fingerprint(&weak, &path_set_hash, &strong, cancel)
                .await
            {
                Ok(Some(metadata)) => {
                    debug!(%weak, %strong, "cache hit");
                    self.record(
                        pip,
                        "lookup-hit",
                        &weak,
                        Some(&path_set_hash),
                        Some(&strong),
                        &format!("{} observations", processed.observations.len()),
                    );
                    return Ok(CacheLookupOutcome::Hit {
                        path_set_hash,
                        strong,
                        metadata,
                    });
                }
                Ok(None) => {
                    rejected += 1;
                }
                Err(err) => {
                    warn!(%weak, %err, "strong fingerprint query failed; forcing execution");
                    return Ok(CacheLookupOutcome::Miss {
                        weak,
                        candidates_rejected: rejected,
                    });
                }
            }
        }

        debug!(%weak, rejected, "cache miss");
        self.record(
            pip,
            "lookup-miss",
            &weak,
            None,
            None,
            &format!("{rejected} candidates rejected"),
        );
        Ok(CacheLookupOutcome::Miss {
            weak,
            candidates_rejected: rejected,
        })
    }

    /// Publish the result of a real execution: the processed observations
    /// plus the produced outputs.
    #[instrument(skip_all, fields(pip = %pip.pip.display_name()))]
    pub async fn publish_execution(
        &self,
        pip: &GraphPip,
        processed: &ProcessedObservations,
        outputs: Vec<OutputRecord>,
        cancel: &CancellationToken,
    ) -> Result<(WeakFingerprint, PathSetHash, StrongFingerprint)> {
        let weak = self.weak_fingerprint(pip);
        let path_set_hash = processed.path_set.content_hash()?;
        let strong = strong_fingerprint(
            self.graph.paths(),
            &weak,
            &path_set_hash,
            &processed.observations,
        );
        let metadata = CacheMetadata {
            strong_fingerprint: strong,
            semi_stable_hash: pip.pip.semi_stable_hash,
            outputs,
        };
        self.backend
            .publish(&weak, &processed.path_set, &metadata, cancel)
            .await?;
        self.record(
            pip,
            "publish",
            &weak,
            Some(&path_set_hash),
            Some(&strong),
            &format!("{} observations", processed.observations.len()),
        );
        Ok((weak, path_set_hash, strong))
    }

    fn record(
        &self,
        pip: &GraphPip,
        event: &str,
        weak: &WeakFingerprint,
        path_set_hash: Option<&PathSetHash>,
        strong: Option<&StrongFingerprint>,
        detail: &str,
    ) {
        if let Some(store) = &self.fingerprint_store {
            if let Err(err) = store.record(
                &pip.pip.display_name(),
                event,
                weak,
                path_set_hash,
                strong,
                detail,
            ) {
                warn!(%err, "fingerprint store append failed");
            }
        }
    }
}
