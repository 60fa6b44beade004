//! Observed-input processing: raw sandbox accesses in, typed path set and
//! strong-fingerprint seed out.
//!
//! The processor runs three passes over an observation sequence sorted by
//! expanded path:
//!
//! - **Pass 0** classifies each observation against the pip's declared
//!   sealed-directory dependencies.
//! - **Pass 1** issues the content queries that hashing-required
//!   observations need; queries are independent and run concurrently.
//! - **Pass 2** resolves existence through the layered views and types
//!   each observation, then applies reclassification rules and absent-path
//!   elision.
//!
//! The processor is generic over an [`ObservationEnvironment`]: the
//! post-execution environment consumes sandbox reports, the cache-lookup
//! environment replays a stored path set. Both produce observations in the
//! same canonical order, which is what makes the strong fingerprint
//! comparable between the two.

pub mod env;
pub mod pathset;
pub mod reclassify;

use std::collections::{BTreeMap, BTreeSet, HashSet};

use color_eyre::Result;
use futures::future;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::{
    config::EngineConfig,
    content::FileContentManager,
    enumerate::{DirectoryFingerprinter, EnumerationFilter, EnumerationMode},
    error::EngineError,
    fs::{FileContentInfo, PathExistence, ReparseKind},
    graph::PipGraph,
    hash::{
        ContentHash, DirectoryFingerprint, FingerprintHasher, PathSetHash, StrongFingerprint,
        WeakFingerprint,
    },
    mount::MountTable,
    path::{NameAtom, PathId},
    pip::GraphPip,
    views::FileSystemView,
};

use self::{
    env::{AccessCheckResult, ObservationEnvironment},
    pathset::{ObservedPathSet, PathSetEntry},
    reclassify::{ObservedInputKind, ReclassificationRule, ReclassificationTarget, first_match},
};

/// How a path was accessed, as reported by the sandbox.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct ObservationFlags {
    /// The access was an existence probe, not a read.
    pub file_probe: bool,
    /// The access named a directory location.
    pub directory_location: bool,
    /// The directory was enumerated.
    pub enumeration: bool,
    /// Content must be hashed to type this observation.
    pub hashing_required: bool,
    /// The enumeration uses search-path semantics.
    pub search_path: bool,
}

impl ObservationFlags {
    /// A plain existence probe.
    pub fn probe() -> Self {
        Self {
            file_probe: true,
            ..Self::default()
        }
    }

    /// A content read.
    pub fn read() -> Self {
        Self {
            hashing_required: true,
            ..Self::default()
        }
    }

    /// A directory enumeration.
    pub fn enumerate() -> Self {
        Self {
            directory_location: true,
            enumeration: true,
            ..Self::default()
        }
    }

    /// A probe on a directory location without enumeration.
    pub fn directory_probe() -> Self {
        Self {
            file_probe: true,
            directory_location: true,
            ..Self::default()
        }
    }
}

/// A raw observation after sandbox ingestion: interned path plus flags.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RawObservation {
    pub path: PathId,
    pub flags: ObservationFlags,
}

/// A typed observation. The variant must agree with filesystem existence as
/// resolved by the layered views at processing time.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ObservedInput {
    AbsentPathProbe {
        path: PathId,
        flags: ObservationFlags,
    },
    FileContentRead {
        path: PathId,
        hash: ContentHash,
    },
    ExistingFileProbe {
        path: PathId,
    },
    ExistingDirectoryProbe {
        path: PathId,
    },
    DirectoryEnumeration {
        path: PathId,
        fingerprint: DirectoryFingerprint,
    },
}

impl ObservedInput {
    pub fn path(&self) -> PathId {
        match self {
            Self::AbsentPathProbe { path, .. }
            | Self::FileContentRead { path, .. }
            | Self::ExistingFileProbe { path }
            | Self::ExistingDirectoryProbe { path }
            | Self::DirectoryEnumeration { path, .. } => *path,
        }
    }

    pub fn kind(&self) -> ObservedInputKind {
        match self {
            Self::AbsentPathProbe { .. } => ObservedInputKind::AbsentPathProbe,
            Self::FileContentRead { .. } => ObservedInputKind::FileContentRead,
            Self::ExistingFileProbe { .. } => ObservedInputKind::ExistingFileProbe,
            Self::ExistingDirectoryProbe { .. } => ObservedInputKind::ExistingDirectoryProbe,
            Self::DirectoryEnumeration { .. } => ObservedInputKind::DirectoryEnumeration,
        }
    }
}

/// Outcome of processing one pip's observations. `Aborted` overrides
/// `Mismatched` overrides `Success` when statuses combine.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, strum::Display)]
pub enum ObservationStatus {
    #[default]
    Success,
    /// Observations no longer match the filesystem: a cache miss, not an
    /// error.
    Mismatched,
    /// The pip must not proceed.
    Aborted,
}

impl ObservationStatus {
    /// Combine two statuses by severity.
    pub fn combine(self, other: Self) -> Self {
        self.max(other)
    }
}

/// Everything a successful processing run yields.
#[derive(Debug)]
pub struct ProcessedObservations {
    pub status: ObservationStatus,
    /// Typed observations in expanded-path order.
    pub observations: Vec<ObservedInput>,
    /// Sorted file-name atoms accessed anywhere by the pip.
    pub accessed_names: BTreeSet<NameAtom>,
    /// The canonical path set for cache publication.
    pub path_set: ObservedPathSet,
    /// Paths whose membership in the fingerprint is dynamic (discovered at
    /// runtime rather than declared), for incremental scheduling.
    pub dynamic_observations: Vec<PathId>,
    /// Undeclared reads the pip was allowed to make, with the content that
    /// was read.
    pub allowed_undeclared_reads: BTreeMap<PathId, ContentHash>,
    /// Classified failures encountered while typing.
    pub failures: Vec<EngineError>,
}

/// Compute the strong fingerprint from its three constituents. The digest
/// is byte-for-byte `hash(weak ∥ pathSetHash ∥ serialized observations)`.
/// Observations serialize by expanded path, never by process-local id.
pub fn strong_fingerprint(
    paths: &crate::path::PathTable,
    weak: &WeakFingerprint,
    path_set_hash: &PathSetHash,
    observations: &[ObservedInput],
) -> StrongFingerprint {
    let mut hasher = FingerprintHasher::new();
    hasher.add_digest("weak", weak.as_bytes());
    hasher.add_digest("pathSet", path_set_hash.as_bytes());
    hasher.add_collection("observations", observations, |h, obs| {
        h.add_u64("kind", obs.kind() as u64);
        h.add_path("path", &paths.expand(obs.path()));
        match obs {
            ObservedInput::FileContentRead { hash, .. } => {
                h.add_hash("content", hash);
            }
            ObservedInput::DirectoryEnumeration { fingerprint, .. } => {
                h.add_digest("membership", fingerprint.as_bytes());
            }
            _ => {}
        }
    });
    StrongFingerprint(hasher.finish())
}

struct WorkItem {
    path: PathId,
    flags: ObservationFlags,
    pattern: Option<lazy_regex::regex::Regex>,
    in_seal: bool,
    under_source_seal: bool,
    is_file_dependency: bool,
    in_dependency_opaque: bool,
    is_own_output: bool,
    info: Option<FileContentInfo>,
    typed: Option<ObservedInput>,
    enumeration: Option<(EnumerationMode, EnumerationFilter)>,
    dropped: bool,
}

/// The observed-input processor. One instance serves every pip in the
/// build; all state it touches is internally synchronized.
#[derive(Clone)]
pub struct ObservedInputProcessor {
    graph: Arc<PipGraph>,
    view: Arc<FileSystemView>,
    content: FileContentManager,
    fingerprinter: Arc<DirectoryFingerprinter>,
    mounts: Arc<MountTable>,
    config: EngineConfig,
    global_rules: Vec<Arc<ReclassificationRule>>,
}

impl ObservedInputProcessor {
    pub fn new(
        graph: Arc<PipGraph>,
        view: Arc<FileSystemView>,
        content: FileContentManager,
        fingerprinter: Arc<DirectoryFingerprinter>,
        mounts: Arc<MountTable>,
        config: EngineConfig,
        global_rules: Vec<Arc<ReclassificationRule>>,
    ) -> Self {
        Self {
            graph,
            view,
            content,
            fingerprinter,
            mounts,
            config,
            global_rules,
        }
    }

    fn allows_undeclared(&self, pip: &GraphPip) -> bool {
        pip.pip.options.allow_undeclared_source_reads || self.config.allow_undeclared_source_reads
    }

    /// Process one pip's observations. The input need not be pre-sorted;
    /// the processor canonicalizes to expanded-path order before typing.
    #[instrument(skip_all, fields(pip = %pip.pip.display_name(), count = observations.len()))]
    pub async fn process<E: ObservationEnvironment>(
        &self,
        environment: &E,
        pip: &GraphPip,
        observations: &[E::Observation],
        cancel: &CancellationToken,
    ) -> Result<ProcessedObservations> {
        let paths = self.graph.paths();
        let seals: Vec<_> = pip
            .pip
            .directory_dependencies
            .iter()
            .filter_map(|artifact| self.graph.seals().lookup(*artifact).ok())
            .collect();
        let pip_view = self.view.pip_view(pip);
        let file_dependencies: HashSet<PathId> =
            pip.pip.file_dependencies.iter().copied().collect();
        let own_outputs: HashSet<PathId> = pip.pip.output_files.iter().copied().collect();
        let allows_undeclared = self.allows_undeclared(pip);

        let mut status = ObservationStatus::Success;
        let mut failures = Vec::new();
        let mut dynamic_observations = Vec::new();
        let mut allowed_undeclared_reads = BTreeMap::new();

        // Pass 0: classify against declared dependencies.
        let mut items: Vec<WorkItem> = observations
            .iter()
            .map(|raw| {
                let path = environment.path_of(raw);
                let mut flags = environment.flags_of(raw);
                flags.search_path |= environment.is_search_path_enumeration(raw);
                let mut in_seal = false;
                let mut under_source_seal = false;
                for seal in &seals {
                    if seal.kind.is_source_seal() {
                        if seal.exposes(paths, path) {
                            under_source_seal = true;
                        } else if path == seal.artifact.root {
                            // A source-seal root observed directly counts
                            // as a dynamic observation.
                            dynamic_observations.push(path);
                        }
                    } else if seal.exposes(paths, path) {
                        in_seal = true;
                    }
                }
                let in_dependency_opaque = pip.pip.directory_dependencies.iter().any(|d| {
                    (d.is_shared_opaque || self.graph.seals().is_opaque_root(d.root))
                        && paths.is_within(path, d.root)
                });
                WorkItem {
                    path,
                    flags,
                    pattern: environment.enumerate_pattern_regex(raw),
                    in_seal,
                    under_source_seal,
                    is_file_dependency: file_dependencies.contains(&path),
                    in_dependency_opaque,
                    is_own_output: own_outputs.contains(&path),
                    info: None,
                    typed: None,
                    enumeration: None,
                    dropped: false,
                }
            })
            .collect();
        items.sort_by(|a, b| paths.cmp_expanded(a.path, b.path));

        // The accessed-name set feeds search-path membership filters, so it
        // is derived before any enumeration is fingerprinted: declared
        // dependencies plus every other observation.
        let mut accessed_names: BTreeSet<NameAtom> = items
            .iter()
            .map(|item| paths.name(item.path))
            .chain(pip.pip.file_dependencies.iter().map(|p| paths.name(*p)))
            .chain(pip.pip.output_files.iter().map(|p| paths.name(*p)))
            .collect();
        for seal in &seals {
            accessed_names.extend(seal.contents.iter().map(|p| paths.name(*p)));
        }
        if let Some(stored) = environment.stored_accessed_names() {
            accessed_names.extend(stored.iter().map(|name| paths.intern_name(name)));
        }

        // Pass 1: content queries, concurrently.
        let queries: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.flags.hashing_required && !item.under_source_seal)
            .map(|(index, _)| index)
            .collect();
        let results = future::join_all(
            queries
                .iter()
                .map(|index| self.content.query(items[*index].path, cancel)),
        )
        .await;
        for (index, result) in queries.into_iter().zip(results) {
            match result {
                Ok(info) => items[index].info = Some(info),
                Err(err) => {
                    warn!(path = %paths.expand(items[index].path), %err, "content query failed");
                    failures.push(EngineError::HashFailure {
                        path: paths.expand(items[index].path),
                        reason: format!("{err:#}"),
                        retryable: true,
                    });
                    status = status.combine(ObservationStatus::Aborted);
                    items[index].dropped = true;
                }
            }
        }

        // Pass 2: existence and typing.
        for index in 0..items.len() {
            if items[index].dropped {
                continue;
            }
            let item_status = self
                .type_observation(
                    environment,
                    pip,
                    &mut items[index],
                    &pip_view,
                    &accessed_names,
                    allows_undeclared,
                    &mut failures,
                )
                .await?;
            status = status.combine(item_status);
            if status == ObservationStatus::Aborted && environment.is_cache_lookup() {
                // No candidate can match once typing aborts.
                break;
            }
        }

        // Reclassification: pip rules first, then global rules. Runs before
        // the policy check so that a dropped observation cannot fail it.
        self.reclassify(pip, &mut items);

        // Policy checks and undeclared-read accounting. Only file-level
        // observations are policed; directory probes, enumerations, and
        // absent probes are fingerprinted and recorded as dynamic, since
        // they carry no content the pip could smuggle in.
        for item in items.iter_mut().filter(|i| !i.dropped && i.typed.is_some()) {
            let declared = item.in_seal
                || item.under_source_seal
                || item.is_file_dependency
                || item.in_dependency_opaque
                || item.is_own_output
                || self.mounts.is_untracked(paths, item.path);
            if declared {
                if item.in_dependency_opaque {
                    dynamic_observations.push(item.path);
                }
                continue;
            }
            let policed = matches!(
                item.typed.as_ref().map(ObservedInput::kind),
                Some(ObservedInputKind::FileContentRead)
                    | Some(ObservedInputKind::ExistingFileProbe)
            );
            if !policed {
                dynamic_observations.push(item.path);
                continue;
            }
            let produced_elsewhere =
                self.graph.is_output(item.path) && !own_outputs.contains(&item.path);
            if allows_undeclared && !produced_elsewhere {
                environment.on_allowing_undeclared_access(pip, item.path);
                let hash = match &item.typed {
                    Some(ObservedInput::FileContentRead { hash, .. }) => *hash,
                    _ => ContentHash::ABSENT_FILE,
                };
                allowed_undeclared_reads.insert(item.path, hash);
                dynamic_observations.push(item.path);
                continue;
            }
            environment.report_unexpected_access(pip, item.path);
            match environment.on_access_check_failure(pip, item.path) {
                AccessCheckResult::Fail => {
                    failures.push(EngineError::AccessPolicyViolation {
                        pip: pip.pip.display_name(),
                        path: paths.expand(item.path),
                    });
                    status = status.combine(environment.access_failure_status());
                }
                AccessCheckResult::Suppress => item.dropped = true,
            }
        }

        // Let the environment veto individual proposals.
        for item in items.iter().filter(|i| !i.dropped) {
            if let Some(typed) = &item.typed {
                status = status.combine(environment.check_proposed_observed_input(pip, typed));
            }
        }

        // Absent-path elision. Cache-lookup runs reconstruct a stored path
        // set and must keep every entry, so they never elide.
        if !environment.is_cache_lookup() {
            self.elide_absent_probes(&mut items);
        }

        let observations: Vec<ObservedInput> = items
            .iter()
            .filter(|item| !item.dropped)
            .filter_map(|item| item.typed.clone())
            .collect();
        let path_set = self.build_path_set(&items, &accessed_names);
        debug!(
            %status,
            observations = observations.len(),
            "processed observations"
        );

        Ok(ProcessedObservations {
            status,
            observations,
            accessed_names,
            path_set,
            dynamic_observations,
            allowed_undeclared_reads,
            failures,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn type_observation<E: ObservationEnvironment>(
        &self,
        environment: &E,
        pip: &GraphPip,
        item: &mut WorkItem,
        pip_view: &crate::views::PipFileSystemView,
        accessed_names: &BTreeSet<NameAtom>,
        allows_undeclared: bool,
        failures: &mut Vec<EngineError>,
    ) -> Result<ObservationStatus> {
        let paths = self.graph.paths();
        let path = item.path;
        let flags = item.flags;

        // Hashing a file that lives under a non-hashable mount is always an
        // error; the pip cannot be fingerprinted soundly.
        if let Some(info) = item.info {
            if info.hash.is_untracked() && info.existence == PathExistence::ExistsAsFile {
                failures.push(self.invariant_diagnostic(
                    pip,
                    item,
                    "content read resolved to an untracked file",
                ));
                item.dropped = true;
                return Ok(ObservationStatus::Aborted);
            }
            if info.existence != PathExistence::ExistsAsDirectory {
                item.typed = Some(if info.hash.is_absent() {
                    ObservedInput::AbsentPathProbe { path, flags }
                } else {
                    ObservedInput::FileContentRead {
                        path,
                        hash: info.hash,
                    }
                });
                return Ok(ObservationStatus::Success);
            }
        }

        // Existence through the layered views: Output first, then Real,
        // with the full graph arbitrating under output mounts.
        let mut existence = self.view.output_existence(path);
        if !existence.exists() {
            let real = self.view.real_existence(path).await?;
            existence = real;
            if real != PathExistence::ExistsAsFile
                && self.mounts.may_contain_outputs(paths, path)
            {
                match self.view.full_graph_existence(path) {
                    PathExistence::ExistsAsDirectory => {
                        existence = PathExistence::ExistsAsDirectory;
                    }
                    PathExistence::ExistsAsFile => {
                        // A source under a writable mount that was not
                        // produced this run: treat as nonexistent.
                        existence = PathExistence::Nonexistent;
                    }
                    PathExistence::Nonexistent => {
                        existence = if allows_undeclared
                            && !self.graph.is_directory_created_by_pip(path)
                        {
                            real
                        } else {
                            PathExistence::Nonexistent
                        };
                    }
                }
            }
        }

        if flags.directory_location
            && !flags.enumeration
            && !existence.exists()
            && self.config.treat_absent_directory_as_existent_under_opaque
            && self
                .graph
                .seals()
                .opaque_containing(paths, path)
                .is_some()
        {
            // An absent directory under an opaque root will exist once the
            // producer runs; typing it absent would flip on replay order.
            existence = PathExistence::ExistsAsDirectory;
        }

        match existence {
            PathExistence::Nonexistent => {
                item.typed = Some(ObservedInput::AbsentPathProbe { path, flags });
            }
            PathExistence::ExistsAsFile => {
                let reparse = match item.info {
                    Some(info) => info.reparse,
                    None => crate::fs::probe_reparse(&paths.expand(path)).await?,
                };
                let treat_as_directory = (flags.directory_location || flags.enumeration)
                    && reparse == ReparseKind::DirectorySymlink;
                if treat_as_directory {
                    if flags.enumeration {
                        self.type_enumeration(
                            environment,
                            pip,
                            item,
                            pip_view,
                            accessed_names,
                            allows_undeclared,
                        )
                        .await?;
                    } else {
                        item.typed = Some(ObservedInput::ExistingDirectoryProbe { path });
                    }
                } else if flags.file_probe {
                    item.typed = Some(ObservedInput::ExistingFileProbe { path });
                } else {
                    let hash = match item.info {
                        Some(info) => info.hash,
                        None => {
                            // Existence came from the output view; the
                            // content manager knows replayed outputs.
                            match self
                                .content
                                .query(path, &CancellationToken::new())
                                .await
                            {
                                Ok(info) if info.existence.exists() => info.hash,
                                _ => {
                                    failures.push(self.invariant_diagnostic(
                                        pip,
                                        item,
                                        "existing file has no obtainable content",
                                    ));
                                    item.dropped = true;
                                    return Ok(ObservationStatus::Aborted);
                                }
                            }
                        }
                    };
                    item.typed = Some(ObservedInput::FileContentRead { path, hash });
                }
            }
            PathExistence::ExistsAsDirectory => {
                if flags.enumeration {
                    self.type_enumeration(
                        environment,
                        pip,
                        item,
                        pip_view,
                        accessed_names,
                        allows_undeclared,
                    )
                    .await?;
                } else {
                    item.typed = Some(ObservedInput::ExistingDirectoryProbe { path });
                }
            }
        }
        Ok(ObservationStatus::Success)
    }

    async fn type_enumeration<E: ObservationEnvironment>(
        &self,
        _environment: &E,
        pip: &GraphPip,
        item: &mut WorkItem,
        pip_view: &crate::views::PipFileSystemView,
        accessed_names: &BTreeSet<NameAtom>,
        allows_undeclared: bool,
    ) -> Result<()> {
        let path = item.path;
        let mode = self.fingerprinter.select_mode(path, allows_undeclared, false);
        let filter = if item.flags.search_path || pip.pip.options.search_path_enumeration {
            EnumerationFilter::SearchPath(accessed_names.clone())
        } else if let Some(pattern) = &item.pattern {
            EnumerationFilter::Pattern(pattern.clone())
        } else {
            EnumerationFilter::AllowAll
        };
        let fingerprint = self
            .fingerprinter
            .fingerprint(path, mode, &filter, Some(pip_view))
            .await?;
        item.enumeration = Some((mode, filter));
        item.typed = Some(if fingerprint == DirectoryFingerprint::ZERO {
            // Canonical absent-or-empty: downstream cannot tell a zero
            // enumeration from an absent probe, by design of the format.
            ObservedInput::AbsentPathProbe {
                path,
                flags: item.flags,
            }
        } else {
            ObservedInput::DirectoryEnumeration { path, fingerprint }
        });
        Ok(())
    }

    fn reclassify(&self, pip: &GraphPip, items: &mut [WorkItem]) {
        let paths = self.graph.paths();
        for item in items.iter_mut().filter(|i| !i.dropped) {
            let Some(typed) = &item.typed else { continue };
            let kind = typed.kind();
            let expanded = paths.expand(item.path);
            let Some(rule) = first_match(
                &pip.pip.reclassification_rules,
                &self.global_rules,
                kind,
                &expanded,
            ) else {
                continue;
            };
            trace!(rule = %rule.name, path = %expanded, "reclassifying");
            match rule.target {
                ReclassificationTarget::Drop => item.dropped = true,
                ReclassificationTarget::As(target) if target != kind => {
                    item.typed = Some(self.convert(item, typed.clone(), target));
                }
                ReclassificationTarget::As(_) => {}
            }
        }
    }

    fn convert(
        &self,
        item: &WorkItem,
        original: ObservedInput,
        target: ObservedInputKind,
    ) -> ObservedInput {
        let path = original.path();
        match target {
            ObservedInputKind::AbsentPathProbe => ObservedInput::AbsentPathProbe {
                path,
                flags: item.flags,
            },
            ObservedInputKind::ExistingFileProbe => ObservedInput::ExistingFileProbe { path },
            ObservedInputKind::ExistingDirectoryProbe => {
                ObservedInput::ExistingDirectoryProbe { path }
            }
            ObservedInputKind::FileContentRead => match item.info {
                Some(info) if !info.hash.is_absent() && !info.hash.is_untracked() => {
                    ObservedInput::FileContentRead {
                        path,
                        hash: info.hash,
                    }
                }
                _ => {
                    warn!(
                        path = %self.graph.paths().expand(path),
                        "cannot reclassify to content read without content; keeping original"
                    );
                    original
                }
            },
            ObservedInputKind::DirectoryEnumeration => ObservedInput::DirectoryEnumeration {
                path,
                fingerprint: DirectoryFingerprint::ZERO,
            },
        }
    }

    /// Drop absent probes that a parent enumeration or a higher absent
    /// probe already accounts for. Items are in expanded-path order, so
    /// parents precede children.
    fn elide_absent_probes(&self, items: &mut [WorkItem]) {
        let paths = self.graph.paths();
        let mut enumerated: Vec<(PathId, EnumerationMode, EnumerationFilter)> = Vec::new();
        let mut kept_absent: Vec<PathId> = Vec::new();

        for index in 0..items.len() {
            let item = &items[index];
            if item.dropped {
                continue;
            }
            if let Some((mode, filter)) = &item.enumeration {
                if matches!(
                    items[index].typed,
                    Some(ObservedInput::DirectoryEnumeration { .. })
                ) {
                    enumerated.push((item.path, *mode, filter.clone()));
                }
                continue;
            }
            if !matches!(items[index].typed, Some(ObservedInput::AbsentPathProbe { .. })) {
                continue;
            }
            let path = item.path;

            let under_absent = kept_absent
                .iter()
                .any(|absent| *absent != path && paths.is_within(path, *absent));
            if under_absent {
                items[index].dropped = true;
                continue;
            }

            let parent = paths.parent(path);
            let elided_by_parent = parent.is_some_and(|parent| {
                enumerated.iter().any(|(dir, mode, filter)| {
                    *dir == parent
                        && self.mode_permits_elision(*mode)
                        && filter.admits(paths, paths.name(path))
                })
            });
            if elided_by_parent {
                items[index].dropped = true;
                continue;
            }
            kept_absent.push(path);
        }
    }

    fn mode_permits_elision(&self, mode: EnumerationMode) -> bool {
        match mode {
            EnumerationMode::RealFilesystem => true,
            EnumerationMode::MinimalGraph | EnumerationMode::MinimalGraphWithAlienFiles => {
                self.config.elide_absent_probes_under_minimal_graph
            }
            EnumerationMode::FullGraph | EnumerationMode::DefaultFingerprint => false,
        }
    }

    fn build_path_set(
        &self,
        items: &[WorkItem],
        accessed_names: &BTreeSet<NameAtom>,
    ) -> ObservedPathSet {
        let paths = self.graph.paths();
        let preserve_casing = self.config.preserve_path_set_casing
            || paths.sensitivity() == crate::path::CaseSensitivity::Sensitive;
        let entries = items
            .iter()
            .filter(|item| !item.dropped && item.typed.is_some())
            .map(|item| {
                let expanded = paths.expand(item.path);
                PathSetEntry {
                    path: if preserve_casing {
                        expanded
                    } else {
                        expanded.to_lowercase()
                    },
                    flags: item.flags,
                    enumerate_pattern: item.pattern.as_ref().map(|p| p.to_string()),
                }
            })
            .collect();
        let names = accessed_names
            .iter()
            .map(|atom| paths.name_str(*atom))
            .collect();
        ObservedPathSet::new(entries, names, self.config.unsafe_options_tag())
    }

    fn invariant_diagnostic(
        &self,
        pip: &GraphPip,
        item: &WorkItem,
        detail: &str,
    ) -> EngineError {
        let paths = self.graph.paths();
        EngineError::InternalInvariant {
            pip: pip.pip.display_name(),
            path: paths.expand(item.path),
            detail: format!(
                "{detail} (flags {:?}, in_seal {}, under_source_seal {}, file_dependency {})",
                item.flags, item.in_seal, item.under_source_seal, item.is_file_dependency
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn status_combines_by_severity() {
        use ObservationStatus::*;
        assert_eq!(Success.combine(Mismatched), Mismatched);
        assert_eq!(Mismatched.combine(Aborted), Aborted);
        assert_eq!(Aborted.combine(Success), Aborted);
        assert_eq!(Success.combine(Success), Success);
    }

    #[test]
    fn strong_fingerprint_is_sensitive_to_each_constituent() {
        let paths = crate::path::PathTable::new();
        let weak = WeakFingerprint([1u8; 32]);
        let path_set = PathSetHash([2u8; 32]);
        let observations = vec![ObservedInput::FileContentRead {
            path: paths.intern("/src/a.c").unwrap(),
            hash: ContentHash::of_buffer(b"x"),
        }];
        let base = strong_fingerprint(&paths, &weak, &path_set, &observations);
        assert_ne!(
            base,
            strong_fingerprint(&paths, &WeakFingerprint([9u8; 32]), &path_set, &observations)
        );
        assert_ne!(
            base,
            strong_fingerprint(&paths, &weak, &PathSetHash([9u8; 32]), &observations)
        );
        assert_ne!(base, strong_fingerprint(&paths, &weak, &path_set, &[]));
    }
}
