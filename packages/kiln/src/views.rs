//! Layered views of path existence.
//!
//! Three views coexist over the same interned paths, plus a per-pip
//! projection:
//!
//! - `Real` probes the on-disk filesystem and memoizes for the build.
//! - `FullGraph` answers from the membership declared by the entire graph.
//! - `Output` tracks only what has actually been produced so far.
//! - the pip view projects a single pip's declared world: its inputs, its
//!   outputs, and the contents of its directory dependencies.
//!
//! Real-view memoization has one carve-out: while an exclusive opaque's
//! materialization is deferred, probes under it must not be cached, because
//! a later materialization changes the answer within the same build.

use std::collections::{BTreeMap, HashMap};

use color_eyre::Result;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tracing::trace;

use crate::{
    fs::{self, PathExistence},
    graph::PipGraph,
    path::{PathId, PathTable},
    pip::GraphPip,
};

/// Which view answers an existence or enumeration query.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, strum::Display)]
pub enum ViewKind {
    Real,
    FullGraph,
    Output,
}

/// When an output became visible to the [`ViewKind::Output`] view.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ProducedWhen {
    /// Produced (or replayed) during this build.
    DuringBuild,
    /// Already on disk from a prior build, discovered before caching.
    BeforeCaching,
}

/// The layered file-system view shared by every pip's processing context.
#[derive(Debug)]
pub struct FileSystemView {
    graph: Arc<PipGraph>,
    real_cache: DashMap<PathId, PathExistence>,
    produced: DashMap<PathId, ProducedWhen>,
    produced_children: DashMap<PathId, Vec<PathId>>,
    /// Opaque roots whose on-disk content is not trustworthy yet.
    unmaterialized: DashSet<PathId>,
    include_outputs_produced_before_caching: bool,
}

impl FileSystemView {
    pub fn new(graph: Arc<PipGraph>, include_outputs_produced_before_caching: bool) -> Self {
        Self {
            graph,
            real_cache: DashMap::new(),
            produced: DashMap::new(),
            produced_children: DashMap::new(),
            unmaterialized: DashSet::new(),
            include_outputs_produced_before_caching,
        }
    }

    fn paths(&self) -> &Arc<PathTable> {
        self.graph.paths()
    }

    /// Report that an output file now exists on disk.
    pub fn report_produced(&self, path: PathId, when: ProducedWhen) {
        if self.produced.insert(path, when).is_some() {
            return;
        }
        let mut child = path;
        while let Some(parent) = self.paths().parent(child) {
            self.produced_children.entry(parent).or_default().push(child);
            let parent_known = self.produced.contains_key(&parent);
            if !parent_known {
                self.produced.insert(parent, when);
            }
            if parent_known || parent == self.paths().root() {
                break;
            }
            child = parent;
        }
    }

    /// Defer trusting the real filesystem under an opaque root until
    /// [`mark_materialized`](Self::mark_materialized) is called.
    pub fn defer_materialization(&self, opaque_root: PathId) {
        self.unmaterialized.insert(opaque_root);
    }

    /// The opaque root's content is now on disk; probes under it may be
    /// cached again.
    pub fn mark_materialized(&self, opaque_root: PathId) {
        self.unmaterialized.remove(&opaque_root);
        // Entries cached while the root was deferred would now be stale.
        let paths = self.paths();
        self.real_cache
            .retain(|path, _| !paths.is_within(*path, opaque_root));
    }

    fn real_caching_allowed(&self, path: PathId) -> bool {
        !self
            .unmaterialized
            .iter()
            .any(|root| self.paths().is_within(path, *root))
    }

    /// Existence according to the on-disk filesystem.
    pub async fn real_existence(&self, path: PathId) -> Result<PathExistence> {
        if let Some(cached) = self.real_cache.get(&path) {
            return Ok(*cached);
        }
        let expanded = self.paths().expand(path);
        let existence = fs::probe(&expanded).await?;
        if self.real_caching_allowed(path) {
            self.real_cache.insert(path, existence);
        } else {
            trace!(%path, "existence not cached: under unmaterialized opaque");
        }
        Ok(existence)
    }

    /// Existence as declared by the entire pip graph.
    pub fn full_graph_existence(&self, path: PathId) -> PathExistence {
        self.graph.graph_existence(path)
    }

    /// Existence according to produced outputs only.
    pub fn output_existence(&self, path: PathId) -> PathExistence {
        let Some(when) = self.produced.get(&path).map(|w| *w) else {
            return PathExistence::Nonexistent;
        };
        if when == ProducedWhen::BeforeCaching && !self.include_outputs_produced_before_caching {
            return PathExistence::Nonexistent;
        }
        if self.produced_children.contains_key(&path) {
            PathExistence::ExistsAsDirectory
        } else {
            PathExistence::ExistsAsFile
        }
    }

    /// Existence in the requested view.
    pub async fn get_existence(&self, path: PathId, view: ViewKind) -> Result<PathExistence> {
        match view {
            ViewKind::Real => self.real_existence(path).await,
            ViewKind::FullGraph => Ok(self.full_graph_existence(path)),
            ViewKind::Output => Ok(self.output_existence(path)),
        }
    }

    /// Invoke `callback` for each immediate child known to the view, as
    /// `(child path, existence)`.
    pub async fn enumerate(
        &self,
        path: PathId,
        view: ViewKind,
        mut callback: impl FnMut(PathId, PathExistence),
    ) -> Result<()> {
        match view {
            ViewKind::Real => {
                let expanded = self.paths().expand(path);
                for (name, kind) in fs::enumerate(&expanded).await? {
                    let child = self.paths().intern_child(path, &name);
                    callback(child, kind);
                }
            }
            ViewKind::FullGraph => {
                for child in self.graph.graph_children(path) {
                    callback(child, self.graph.graph_existence(child));
                }
            }
            ViewKind::Output => {
                if let Some(children) = self.produced_children.get(&path) {
                    for child in children.iter() {
                        callback(*child, self.output_existence(*child));
                    }
                }
            }
        }
        Ok(())
    }

    /// Build the pip-scoped projection for one pip.
    pub fn pip_view(&self, pip: &GraphPip) -> PipFileSystemView {
        let mut membership = BTreeMap::new();
        let mut declare_file = |path: PathId| {
            membership.insert(path, PathExistence::ExistsAsFile);
        };
        for file in &pip.pip.file_dependencies {
            declare_file(*file);
        }
        for file in &pip.pip.output_files {
            declare_file(*file);
        }
        for dir in &pip.pip.directory_dependencies {
            if let Ok(seal) = self.graph.seals().lookup(*dir) {
                for member in &seal.contents {
                    declare_file(*member);
                }
            }
        }
        for dir in &pip.pip.output_directories {
            membership.insert(dir.root, PathExistence::ExistsAsDirectory);
        }

        let mut children: HashMap<PathId, Vec<PathId>> = HashMap::new();
        let files: Vec<PathId> = membership.keys().copied().collect();
        for path in files {
            let mut child = path;
            while let Some(parent) = self.paths().parent(child) {
                let entry = children.entry(parent).or_default();
                if !entry.contains(&child) {
                    entry.push(child);
                }
                let parent_known = membership.contains_key(&parent);
                membership
                    .entry(parent)
                    .or_insert(PathExistence::ExistsAsDirectory);
                if parent_known || parent == self.paths().root() {
                    break;
                }
                child = parent;
            }
        }

        PipFileSystemView {
            membership,
            children,
        }
    }
}

/// A single pip's declared world: its inputs, outputs, and the contents of
/// its directory dependencies. Queries never touch the disk.
#[derive(Debug)]
pub struct PipFileSystemView {
    membership: BTreeMap<PathId, PathExistence>,
    children: HashMap<PathId, Vec<PathId>>,
}

impl PipFileSystemView {
    pub fn existence(&self, path: PathId) -> PathExistence {
        self.membership
            .get(&path)
            .copied()
            .unwrap_or(PathExistence::Nonexistent)
    }

    pub fn children(&self, path: PathId) -> &[PathId] {
        self.children.get(&path).map(Vec::as_slice).unwrap_or(&[])
    }
}
