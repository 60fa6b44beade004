//! Directory-membership fingerprinting.
//!
//! An enumeration's fingerprint must stay stable across unrelated changes
//! (a new file in a PATH-like directory must not rebuild the world) while
//! remaining sound when outputs appear dynamically. Five strategies cover
//! the space; the mode is selected per enumeration from the mount and the
//! configured filesystem mode.
//!
//! An empty membership digests to [`DirectoryFingerprint::ZERO`], which
//! callers canonicalize into an absent-path probe: an empty directory and a
//! missing one are indistinguishable downstream.

use std::{collections::BTreeSet, sync::Arc};

use color_eyre::Result;
use dashmap::{DashMap, DashSet};
use lazy_regex::regex::Regex;
use tracing::{instrument, trace};

use crate::{
    config::{EngineConfig, FileSystemMode},
    fs::{self, PathExistence},
    graph::PipGraph,
    hash::{DirectoryFingerprint, FingerprintHasher},
    mount::MountTable,
    path::{NameAtom, PathId, PathTable},
    views::{FileSystemView, PipFileSystemView, ViewKind},
};

/// The membership strategy used for one enumeration.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, strum::Display)]
pub enum EnumerationMode {
    /// No membership at all; the fingerprint is the zero digest.
    DefaultFingerprint,
    /// Children known to the full-graph view.
    FullGraph,
    /// Children known to the pip view only.
    MinimalGraph,
    /// Pip view plus real-filesystem entries that are not other pips'
    /// outputs and not stale shared-opaque leftovers.
    MinimalGraphWithAlienFiles,
    /// Live real-filesystem enumeration.
    RealFilesystem,
}

impl EnumerationMode {
    pub fn is_minimal(self) -> bool {
        matches!(self, Self::MinimalGraph | Self::MinimalGraphWithAlienFiles)
    }
}

/// Which members an enumeration admits.
#[derive(Clone, Debug)]
pub enum EnumerationFilter {
    AllowAll,
    /// Admit names matching the pattern.
    Pattern(Regex),
    /// Admit names matching any branch.
    Union(Vec<EnumerationFilter>),
    /// Admit only file names the pip actually referenced. Keeps PATH-like
    /// directories from poisoning the fingerprint.
    SearchPath(BTreeSet<NameAtom>),
}

impl EnumerationFilter {
    pub fn admits(&self, paths: &PathTable, atom: NameAtom) -> bool {
        match self {
            Self::AllowAll => true,
            Self::Pattern(pattern) => pattern.is_match(&paths.name_str(atom)),
            Self::Union(branches) => branches.iter().any(|b| b.admits(paths, atom)),
            Self::SearchPath(names) => names.contains(&atom),
        }
    }

    pub fn is_search_path(&self) -> bool {
        matches!(self, Self::SearchPath(_))
    }

    /// A stable identity for the fingerprint cache key. Search-path filters
    /// are per-pip and never cached.
    fn cache_identity(&self) -> Option<String> {
        match self {
            Self::AllowAll => Some("*".to_owned()),
            Self::Pattern(pattern) => Some(format!("re:{pattern}")),
            Self::Union(branches) => branches
                .iter()
                .map(Self::cache_identity)
                .collect::<Option<Vec<_>>>()
                .map(|ids| ids.join("|")),
            Self::SearchPath(_) => None,
        }
    }
}

/// Computes and caches directory-membership fingerprints.
#[derive(Debug)]
pub struct DirectoryFingerprinter {
    graph: Arc<PipGraph>,
    view: Arc<FileSystemView>,
    mounts: Arc<MountTable>,
    filesystem_mode: FileSystemMode,
    lazy_shared_opaque_deletion: bool,
    build_start: jiff::Timestamp,
    cache: DashMap<(PathId, EnumerationMode, String), DirectoryFingerprint>,
    /// Files left behind by shared opaques of earlier builds, pending lazy
    /// scrub.
    stale_shared_opaque: DashSet<PathId>,
    /// Source files a pip is allowed to rewrite in place.
    allowed_source_rewrites: DashSet<PathId>,
}

impl DirectoryFingerprinter {
    pub fn new(
        graph: Arc<PipGraph>,
        view: Arc<FileSystemView>,
        mounts: Arc<MountTable>,
        config: &EngineConfig,
        build_start: jiff::Timestamp,
    ) -> Self {
        Self {
            graph,
            view,
            mounts,
            filesystem_mode: config.filesystem_mode,
            lazy_shared_opaque_deletion: config.lazy_shared_opaque_deletion,
            build_start,
            cache: DashMap::new(),
            stale_shared_opaque: DashSet::new(),
            allowed_source_rewrites: DashSet::new(),
        }
    }

    fn paths(&self) -> &Arc<PathTable> {
        self.graph.paths()
    }

    /// Mark a file as a stale shared-opaque leftover awaiting scrub.
    pub fn mark_stale_shared_opaque(&self, path: PathId) {
        self.stale_shared_opaque.insert(path);
    }

    /// Mark a source file as legitimately rewritten by a pip.
    pub fn allow_source_rewrite(&self, path: PathId) {
        self.allowed_source_rewrites.insert(path);
    }

    /// Choose the strategy for one enumeration.
    pub fn select_mode(
        &self,
        path: PathId,
        pip_allows_undeclared_reads: bool,
        force_minimal: bool,
    ) -> EnumerationMode {
        let Some(mount) = self.mounts.mount_containing(self.paths(), path) else {
            return EnumerationMode::DefaultFingerprint;
        };
        if !mount.readable || !mount.hashable {
            return EnumerationMode::DefaultFingerprint;
        }
        if pip_allows_undeclared_reads
            || self.filesystem_mode == FileSystemMode::AlwaysMinimalWithAlienFiles
        {
            return EnumerationMode::MinimalGraphWithAlienFiles;
        }
        if force_minimal || self.filesystem_mode == FileSystemMode::RealAndMinimalPipGraph {
            return EnumerationMode::MinimalGraph;
        }
        if mount.allows_outputs() {
            // Output mounts change under the build; the disk cannot be
            // trusted to be stable, the declared graph can.
            return EnumerationMode::FullGraph;
        }
        EnumerationMode::RealFilesystem
    }

    /// Compute the membership fingerprint for `path` under `mode`.
    ///
    /// Results are cached per `(path, filter, mode)` for the modes whose
    /// answer cannot change between pips; minimal-graph modes depend on the
    /// pip and search-path filters depend on the pip's accesses, so neither
    /// is cached. Concurrent callers may race to compute the same key; the
    /// computation is deterministic, so the duplicates agree.
    #[instrument(skip(self, filter, pip_view), fields(path = %self.paths().expand(path), %mode))]
    pub async fn fingerprint(
        &self,
        path: PathId,
        mode: EnumerationMode,
        filter: &EnumerationFilter,
        pip_view: Option<&PipFileSystemView>,
    ) -> Result<DirectoryFingerprint> {
        if mode == EnumerationMode::DefaultFingerprint {
            return Ok(DirectoryFingerprint::ZERO);
        }

        let cache_key = (!mode.is_minimal())
            .then(|| filter.cache_identity())
            .flatten()
            .map(|identity| (path, mode, identity));
        if let Some(key) = &cache_key {
            if let Some(cached) = self.cache.get(key) {
                return Ok(*cached);
            }
        }

        let mut members = self.members(path, mode, pip_view).await?;
        members.retain(|(atom, _)| filter.admits(self.paths(), *atom));
        let paths = self.paths();
        members.sort_by(|(a, _), (b, _)| {
            paths
                .sensitivity()
                .cmp_names(&paths.name_str(*a), &paths.name_str(*b))
        });
        members.dedup_by_key(|(atom, _)| *atom);

        let fingerprint = Self::digest(paths, &members);
        trace!(members = members.len(), %fingerprint, "enumerated");
        if let Some(key) = cache_key {
            self.cache.insert(key, fingerprint);
        }
        Ok(fingerprint)
    }

    fn digest(
        paths: &PathTable,
        members: &[(NameAtom, PathExistence)],
    ) -> DirectoryFingerprint {
        if members.is_empty() {
            return DirectoryFingerprint::ZERO;
        }
        let mut hasher = FingerprintHasher::new();
        hasher.add_collection("members", members, |h, (atom, kind)| {
            h.add_str("name", &paths.name_str(*atom));
            h.add_u64(
                "kind",
                match kind {
                    PathExistence::ExistsAsDirectory => 1,
                    _ => 0,
                },
            );
        });
        DirectoryFingerprint(hasher.finish())
    }

    async fn members(
        &self,
        path: PathId,
        mode: EnumerationMode,
        pip_view: Option<&PipFileSystemView>,
    ) -> Result<Vec<(NameAtom, PathExistence)>> {
        let paths = Arc::clone(self.paths());
        let mut members = Vec::new();
        match mode {
            EnumerationMode::DefaultFingerprint => {}
            EnumerationMode::FullGraph => {
                self.view
                    .enumerate(path, ViewKind::FullGraph, |child, kind| {
                        members.push((paths.name(child), kind));
                    })
                    .await?;
            }
            EnumerationMode::MinimalGraph => {
                Self::pip_view_members(&paths, path, pip_view, &mut members);
            }
            EnumerationMode::RealFilesystem => {
                self.view
                    .enumerate(path, ViewKind::Real, |child, kind| {
                        members.push((paths.name(child), kind));
                    })
                    .await?;
            }
            EnumerationMode::MinimalGraphWithAlienFiles => {
                Self::pip_view_members(&paths, path, pip_view, &mut members);
                let mut real = Vec::new();
                self.view
                    .enumerate(path, ViewKind::Real, |child, kind| {
                        real.push((child, kind));
                    })
                    .await?;
                for (child, kind) in real {
                    if self.is_alien_admissible(child, kind).await? {
                        members.push((paths.name(child), kind));
                    }
                }
            }
        }
        Ok(members)
    }

    fn pip_view_members(
        paths: &PathTable,
        path: PathId,
        pip_view: Option<&PipFileSystemView>,
        members: &mut Vec<(NameAtom, PathExistence)>,
    ) {
        if let Some(view) = pip_view {
            for child in view.children(path) {
                members.push((paths.name(*child), view.existence(*child)));
            }
        }
    }

    /// Whether a real-filesystem entry may appear as an *alien* member: a
    /// file that belongs to no pip and predates the build.
    async fn is_alien_admissible(&self, child: PathId, kind: PathExistence) -> Result<bool> {
        let paths = self.paths();
        if self.mounts.is_untracked(paths, child) {
            return Ok(false);
        }
        if kind == PathExistence::ExistsAsDirectory {
            // Directories created by pips are invisible unless the static
            // graph also declares them.
            if self.graph.is_directory_created_by_pip(child)
                && !self.graph.graph_existence(child).exists()
            {
                return Ok(false);
            }
            return Ok(true);
        }
        if self.graph.is_output(child) && !self.allowed_source_rewrites.contains(&child) {
            return Ok(false);
        }
        if self.lazy_shared_opaque_deletion && self.stale_shared_opaque.contains(&child) {
            return Ok(false);
        }
        if self.allowed_source_rewrites.contains(&child) {
            return Ok(true);
        }
        // Files that appeared after the build started are someone's
        // side-effect, not sources.
        if let Some(modified) = fs::modified_at(&paths.expand(child)).await? {
            if modified > self.build_start {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
