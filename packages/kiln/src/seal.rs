//! Sealed directories: immutable contracts over directory contents.
//!
//! A sealed directory tells downstream pips exactly which files a directory
//! exposes. Partial and full seals enumerate their contents; source seals
//! expose no contents but match any path under the root (optionally subject
//! to a pattern); opaque directories declare only their root, with contents
//! discovered at runtime.

use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use color_eyre::{Result, eyre::eyre};
use dashmap::DashMap;
use derive_more::Display;
use lazy_regex::regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    error::EngineError,
    path::{PathId, PathTable},
    pip::PipId,
};

/// The contract kind of a sealed directory.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, strum::Display, Serialize, Deserialize)]
pub enum SealKind {
    /// Exposes a declared subset of the directory's files.
    Partial,
    /// Exposes every file under the root at seal time.
    Full,
    /// Source seal matching immediate children only.
    SourceTop,
    /// Source seal matching the whole subtree.
    SourceAll,
    /// Output directory with exactly one producer.
    ExclusiveOpaque,
    /// Output directory that many pips may contribute to.
    SharedOpaque,
}

impl SealKind {
    pub fn is_source_seal(self) -> bool {
        matches!(self, Self::SourceTop | Self::SourceAll)
    }

    pub fn is_opaque(self) -> bool {
        matches!(self, Self::ExclusiveOpaque | Self::SharedOpaque)
    }
}

/// Reference to a sealed directory: the root path plus the seal id that
/// distinguishes multiple seals over the same root.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("{root}#{seal_id}")]
pub struct DirectoryArtifact {
    pub root: PathId,
    pub seal_id: u32,
    pub is_shared_opaque: bool,
}

/// A committed seal: contents are immutable once added.
#[derive(Debug)]
pub struct SealedDirectory {
    pub artifact: DirectoryArtifact,
    pub kind: SealKind,
    /// Sorted set of member files. Empty for source seals and opaques.
    pub contents: BTreeSet<PathId>,
    /// Optional filter for source seals: a member path's name must match.
    pub pattern: Option<Regex>,
    /// The pip that defined the seal.
    pub producer: PipId,
}

impl SealedDirectory {
    /// Whether a path is exposed by this seal.
    ///
    /// For enumerated seals this is content membership; for source seals it
    /// is containment under the root (top-only for [`SealKind::SourceTop`])
    /// subject to the pattern. Opaque contents are dynamic and never match
    /// statically.
    pub fn exposes(&self, table: &PathTable, path: PathId) -> bool {
        match self.kind {
            SealKind::Partial | SealKind::Full => self.contents.contains(&path),
            SealKind::SourceTop => {
                table.parent(path) == Some(self.artifact.root) && self.matches_pattern(table, path)
            }
            SealKind::SourceAll => {
                path != self.artifact.root
                    && table.is_within(path, self.artifact.root)
                    && self.matches_pattern(table, path)
            }
            SealKind::ExclusiveOpaque | SealKind::SharedOpaque => false,
        }
    }

    fn matches_pattern(&self, table: &PathTable, path: PathId) -> bool {
        match &self.pattern {
            Some(pattern) => pattern.is_match(&table.name_str(table.name(path))),
            None => true,
        }
    }
}

/// Registry of directory seals for the whole graph.
///
/// Internally synchronized. Seal ids are allocated by [`reserve`] and
/// [`create_shared_opaque`]; committing contents with [`add_seal`] is
/// one-shot per seal.
///
/// [`reserve`]: SealedDirectoryTable::reserve
/// [`create_shared_opaque`]: SealedDirectoryTable::create_shared_opaque
/// [`add_seal`]: SealedDirectoryTable::add_seal
#[derive(Debug, Default)]
pub struct SealedDirectoryTable {
    next_seal_id: AtomicU32,
    seals: DashMap<u32, Arc<SealedDirectory>>,
    // Exclusive opaque roots may have at most one producer.
    exclusive_roots: DashMap<PathId, u32>,
    // All opaque roots, for "is this path under some output directory".
    opaque_roots: DashMap<PathId, DirectoryArtifact>,
}

impl SealedDirectoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an artifact for a non-shared-opaque seal.
    pub fn reserve(&self, root: PathId, kind: SealKind) -> Result<DirectoryArtifact> {
        let seal_id = self.next_seal_id.fetch_add(1, Ordering::Relaxed);
        let artifact = DirectoryArtifact {
            root,
            seal_id,
            is_shared_opaque: false,
        };
        if kind == SealKind::ExclusiveOpaque {
            if self.exclusive_roots.insert(root, seal_id).is_some() {
                return Err(EngineError::Graph {
                    reason: format!("exclusive opaque root {root} already has a producer"),
                }
                .into());
            }
            self.opaque_roots.insert(root, artifact);
        }
        trace!(%artifact, ?kind, "reserved seal");
        Ok(artifact)
    }

    /// Allocate an artifact under shared-opaque semantics. Multiple pips may
    /// each hold a distinct artifact for the same root.
    pub fn create_shared_opaque(&self, root: PathId) -> DirectoryArtifact {
        let seal_id = self.next_seal_id.fetch_add(1, Ordering::Relaxed);
        let artifact = DirectoryArtifact {
            root,
            seal_id,
            is_shared_opaque: true,
        };
        self.opaque_roots.entry(root).or_insert(artifact);
        trace!(%artifact, "created shared opaque");
        artifact
    }

    /// Commit the seal's contents. No further mutation is permitted.
    pub fn add_seal(
        &self,
        table: &PathTable,
        artifact: DirectoryArtifact,
        kind: SealKind,
        contents: BTreeSet<PathId>,
        pattern: Option<Regex>,
        producer: PipId,
    ) -> Result<()> {
        if self.seals.contains_key(&artifact.seal_id) {
            return Err(EngineError::Graph {
                reason: format!("seal {artifact} committed twice"),
            }
            .into());
        }
        if kind.is_source_seal() && !contents.is_empty() {
            return Err(EngineError::Graph {
                reason: format!("source seal {artifact} must not enumerate contents"),
            }
            .into());
        }
        for member in &contents {
            if !table.is_within(*member, artifact.root) {
                return Err(EngineError::Graph {
                    reason: format!(
                        "seal member {} is outside root {}",
                        table.expand(*member),
                        table.expand(artifact.root)
                    ),
                }
                .into());
            }
        }
        let sealed = Arc::new(SealedDirectory {
            artifact,
            kind,
            contents,
            pattern,
            producer,
        });
        trace!(%artifact, ?kind, members = sealed.contents.len(), "committed seal");
        self.seals.insert(artifact.seal_id, sealed);
        Ok(())
    }

    /// Resolve an artifact to its committed seal.
    pub fn lookup(&self, artifact: DirectoryArtifact) -> Result<Arc<SealedDirectory>> {
        self.seals
            .get(&artifact.seal_id)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| eyre!("seal {artifact} is not committed"))
    }

    /// The innermost opaque output directory containing `path`, if any.
    pub fn opaque_containing(&self, table: &PathTable, path: PathId) -> Option<DirectoryArtifact> {
        table
            .hierarchy(path)
            .find_map(|ancestor| self.opaque_roots.get(&ancestor).map(|a| *a))
    }

    /// Whether `root` is the root of some opaque output directory.
    pub fn is_opaque_root(&self, root: PathId) -> bool {
        self.opaque_roots.contains_key(&root)
    }
}
