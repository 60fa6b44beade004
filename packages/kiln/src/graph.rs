//! In-memory pip graph and static fingerprints.
//!
//! The graph accepts pips one at a time (an *add-pip* operation per kind),
//! assigns monotonically increasing ids, rejects duplicate producers, and
//! computes each pip's static fingerprint at add time. Because a pip may
//! only depend on pips that are already in the graph, the dependency
//! relation is acyclic by construction; the builder verifies this instead
//! of trusting callers.
//!
//! The graph also maintains the *full-graph* filesystem membership that the
//! [`views`](crate::views) module projects: every declared file (source or
//! output) appears as a file node, and every ancestor of a declared file is
//! a directory node.

use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use color_eyre::Result;
use dashmap::{DashMap, DashSet, mapref::entry::Entry};
use lazy_regex::regex::Regex;
use tracing::{debug, instrument};

use crate::{
    error::EngineError,
    fs::PathExistence,
    hash::{FingerprintHasher, StaticFingerprint},
    observe::reclassify::ReclassificationRule,
    path::{PathId, PathTable},
    pip::{GraphPip, Pip, PipId, PipKind},
    seal::{DirectoryArtifact, SealKind, SealedDirectoryTable},
};

/// Salts mixed into every static fingerprint. Changing any of these
/// invalidates every cache entry, which is exactly the point.
#[derive(Clone, Debug, Default)]
pub struct GraphSalts {
    pub fingerprint_salt: String,
    /// Digest of the configured directory-membership rule set.
    pub membership_rules_hash: u64,
    /// Digest of the global reclassification rules.
    pub reclassification_rules_hash: u64,
}

/// The pip graph under construction and the queries the rest of the engine
/// asks of it. Internally synchronized; `add` may race with reads.
#[derive(Debug)]
pub struct PipGraph {
    paths: Arc<PathTable>,
    seals: Arc<SealedDirectoryTable>,
    salts: GraphSalts,
    next_id: AtomicU32,
    pips: DashMap<PipId, GraphPip>,
    /// Producer of each declared output file and opaque root.
    producers: DashMap<PathId, PipId>,
    /// Full-graph filesystem membership.
    membership: DashMap<PathId, PathExistence>,
    children: DashMap<PathId, Vec<PathId>>,
    /// Directories that exist only because some pip creates them.
    created_directories: DashSet<PathId>,
}

impl PipGraph {
    pub fn new(
        paths: Arc<PathTable>,
        seals: Arc<SealedDirectoryTable>,
        salts: GraphSalts,
    ) -> Self {
        Self {
            paths,
            seals,
            salts,
            next_id: AtomicU32::new(0),
            pips: DashMap::new(),
            producers: DashMap::new(),
            membership: DashMap::new(),
            children: DashMap::new(),
            created_directories: DashSet::new(),
        }
    }

    pub fn paths(&self) -> &Arc<PathTable> {
        &self.paths
    }

    pub fn seals(&self) -> &Arc<SealedDirectoryTable> {
        &self.seals
    }

    /// Add a pip of any kind. Returns the assigned id, or a
    /// [`EngineError::Graph`] on duplicate producers, dangling
    /// dependencies, or forward (cyclic) references.
    #[instrument(skip(self, pip), fields(pip = %pip.display_name()))]
    pub fn add(&self, pip: Pip) -> Result<PipId> {
        let id = PipId(self.next_id.fetch_add(1, Ordering::SeqCst));

        for dep in &pip.explicit_dependencies {
            if dep.0 >= id.0 {
                return Err(EngineError::Graph {
                    reason: format!(
                        "{} depends on {dep} which is not yet in the graph; \
                         dependencies must be added before dependents",
                        pip.display_name()
                    ),
                }
                .into());
            }
        }
        for dep in &pip.file_dependencies {
            // A file dependency on another pip's output implies an edge;
            // the producer must already be present.
            if let Some(producer) = self.producers.get(dep) {
                if producer.0 >= id.0 {
                    return Err(EngineError::Graph {
                        reason: format!(
                            "{} consumes {} before its producer is added",
                            pip.display_name(),
                            self.paths.expand(*dep)
                        ),
                    }
                    .into());
                }
            }
        }

        for output in &pip.output_files {
            if self.producers.insert(*output, id).is_some() {
                return Err(EngineError::Graph {
                    reason: format!(
                        "duplicate producer for {}",
                        self.paths.expand(*output)
                    ),
                }
                .into());
            }
        }
        for dir in &pip.output_directories {
            // Shared opaque roots admit many producers; exclusivity for
            // exclusive opaques is enforced by the seal table at reserve
            // time.
            self.producers.entry(dir.root).or_insert(id);
            self.created_directories.insert(dir.root);
            self.insert_membership(dir.root, PathExistence::ExistsAsDirectory);
        }

        for file in pip
            .file_dependencies
            .iter()
            .chain(pip.output_files.iter())
        {
            self.insert_membership(*file, PathExistence::ExistsAsFile);
        }
        for dir in &pip.directory_dependencies {
            if let Ok(seal) = self.seals.lookup(*dir) {
                for member in &seal.contents {
                    self.insert_membership(*member, PathExistence::ExistsAsFile);
                }
            }
        }

        let static_fingerprint = self.compute_static_fingerprint(&pip);
        let stored = GraphPip {
            id,
            static_fingerprint,
            pip: Arc::new(pip),
        };
        debug!(%id, %static_fingerprint, "added pip");
        self.pips.insert(id, stored);
        Ok(id)
    }

    /// Add a process pip.
    pub fn add_process(&self, pip: Pip) -> Result<PipId> {
        self.add_of_kind(pip, PipKind::Process)
    }

    /// Add a copy-file pip.
    pub fn add_copy_file(&self, pip: Pip) -> Result<PipId> {
        self.add_of_kind(pip, PipKind::CopyFile)
    }

    /// Add a write-file pip.
    pub fn add_write_file(&self, pip: Pip) -> Result<PipId> {
        self.add_of_kind(pip, PipKind::WriteFile)
    }

    /// Add an IPC pip.
    pub fn add_ipc(&self, pip: Pip) -> Result<PipId> {
        self.add_of_kind(pip, PipKind::Ipc)
    }

    fn add_of_kind(&self, mut pip: Pip, kind: PipKind) -> Result<PipId> {
        pip.kind = kind;
        self.add(pip)
    }

    /// Reserve, commit, and register a sealed directory in one operation.
    #[instrument(skip(self, contents, pattern))]
    pub fn add_seal_directory(
        &self,
        root: PathId,
        kind: SealKind,
        contents: BTreeSet<PathId>,
        pattern: Option<Regex>,
        semi_stable_hash: u64,
    ) -> Result<(PipId, DirectoryArtifact)> {
        let artifact = if kind == SealKind::SharedOpaque {
            self.seals.create_shared_opaque(root)
        } else {
            self.seals.reserve(root, kind)?
        };
        let pip = Pip::builder()
            .kind(PipKind::SealDirectory)
            .semi_stable_hash(semi_stable_hash)
            .description(format!("seal {} ({kind})", self.paths.expand(root)))
            .build();
        let id = self.add(pip)?;
        self.seals
            .add_seal(&self.paths, artifact, kind, contents, pattern, id)?;
        if kind.is_opaque() {
            self.created_directories.insert(root);
        }
        Ok((id, artifact))
    }

    /// The pip stored under `id`.
    pub fn pip(&self, id: PipId) -> Option<GraphPip> {
        self.pips.get(&id).map(|p| p.clone())
    }

    pub fn pip_count(&self) -> usize {
        self.pips.len()
    }

    /// The pip that produces `path`, if it is a declared output.
    pub fn producer_of(&self, path: PathId) -> Option<PipId> {
        self.producers.get(&path).map(|p| *p)
    }

    /// Whether `path` is a declared output of any pip, directly or under an
    /// opaque root.
    pub fn is_output(&self, path: PathId) -> bool {
        if self.producers.contains_key(&path) {
            return true;
        }
        self.seals.opaque_containing(&self.paths, path).is_some()
    }

    /// Whether the directory at `path` exists only because a pip creates it.
    pub fn is_directory_created_by_pip(&self, path: PathId) -> bool {
        self.created_directories.contains(&path)
    }

    /// Record a directory the scheduler actually created on disk.
    pub fn register_created_directory(&self, path: PathId) {
        self.created_directories.insert(path);
    }

    /// Existence of `path` as declared by the entire graph.
    pub fn graph_existence(&self, path: PathId) -> PathExistence {
        self.membership
            .get(&path)
            .map(|e| *e)
            .unwrap_or(PathExistence::Nonexistent)
    }

    /// The immediate children of `path` known to the graph.
    pub fn graph_children(&self, path: PathId) -> Vec<PathId> {
        self.children
            .get(&path)
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn insert_membership(&self, path: PathId, existence: PathExistence) {
        let inserted = match self.membership.entry(path) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(existence);
                true
            }
        };
        if !inserted {
            return;
        }
        // Walk up registering directory nodes and child links until we meet
        // a part of the tree that is already present.
        let mut child = path;
        while let Some(parent) = self.paths.parent(child) {
            self.children.entry(parent).or_default().push(child);
            let parent_was_new = match self.membership.entry(parent) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(PathExistence::ExistsAsDirectory);
                    true
                }
            };
            if !parent_was_new || parent == self.paths.root() {
                break;
            }
            child = parent;
        }
    }

    fn compute_static_fingerprint(&self, pip: &Pip) -> StaticFingerprint {
        let mut hasher = FingerprintHasher::new();
        hasher
            .add_str("kind", &pip.kind.to_string())
            .add_u64("semiStableHash", pip.semi_stable_hash)
            .add_str("description", &pip.description)
            .add_str("salt", &self.salts.fingerprint_salt)
            .add_u64("membershipRules", self.salts.membership_rules_hash)
            .add_u64(
                "reclassificationRules",
                self.salts.reclassification_rules_hash,
            );

        let mut deps = pip.file_dependencies.clone();
        self.paths.sort_expanded(&mut deps);
        hasher.add_collection("fileDependencies", deps, |h, path| {
            h.add_path("path", &self.paths.expand(path));
        });
        hasher.add_collection(
            "directoryDependencies",
            &pip.directory_dependencies,
            |h, dir| {
                h.add_path("root", &self.paths.expand(dir.root));
                h.add_u64("sealId", dir.seal_id as u64);
            },
        );
        let mut outputs = pip.output_files.clone();
        self.paths.sort_expanded(&mut outputs);
        hasher.add_collection("outputFiles", outputs, |h, path| {
            h.add_path("path", &self.paths.expand(path));
        });
        hasher.add_collection("outputDirectories", &pip.output_directories, |h, dir| {
            h.add_path("root", &self.paths.expand(dir.root));
        });
        hasher.add_collection("tags", &pip.tags, |h, tag| {
            h.add_str("tag", tag);
        });
        hasher
            .add_u64(
                "allowUndeclaredSourceReads",
                pip.options.allow_undeclared_source_reads as u64,
            )
            .add_u64(
                "searchPathEnumeration",
                pip.options.search_path_enumeration as u64,
            );
        hasher.add_collection(
            "pipReclassificationRules",
            &pip.reclassification_rules,
            |h, rule| {
                h.add_u64("rule", rule.definition_hash());
            },
        );
        StaticFingerprint(hasher.finish())
    }
}

/// Digest a rule list for use as a graph salt.
pub fn rules_hash(rules: &[Arc<ReclassificationRule>]) -> u64 {
    let mut hasher = FingerprintHasher::new();
    hasher.add_collection("rules", rules, |h, rule| {
        h.add_u64("rule", rule.definition_hash());
    });
    let digest = hasher.finish();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::path::CaseSensitivity;

    fn graph() -> PipGraph {
        let paths = Arc::new(PathTable::with_sensitivity(CaseSensitivity::Sensitive));
        let seals = Arc::new(SealedDirectoryTable::new());
        PipGraph::new(paths, seals, GraphSalts::default())
    }

    #[test]
    fn ids_are_monotonic() {
        let graph = graph();
        let a = graph
            .add(Pip::builder().semi_stable_hash(1).description("a").build())
            .unwrap();
        let b = graph
            .add(Pip::builder().semi_stable_hash(2).description("b").build())
            .unwrap();
        assert!(b.0 > a.0);
    }

    #[test]
    fn duplicate_producers_are_rejected() {
        let graph = graph();
        let out = graph.paths().intern("/out/a.obj").unwrap();
        graph
            .add(
                Pip::builder()
                    .semi_stable_hash(1)
                    .description("first")
                    .output_files(vec![out])
                    .build(),
            )
            .unwrap();
        let err = graph
            .add(
                Pip::builder()
                    .semi_stable_hash(2)
                    .description("second")
                    .output_files(vec![out])
                    .build(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("duplicate producer"));
    }

    #[test]
    fn forward_references_are_rejected() {
        let graph = graph();
        let err = graph
            .add(
                Pip::builder()
                    .semi_stable_hash(1)
                    .description("dangling")
                    .explicit_dependencies(vec![PipId(7)])
                    .build(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("not yet in the graph"));
    }

    #[test]
    fn membership_covers_ancestors() {
        let graph = graph();
        let out = graph.paths().intern("/out/bin/tool").unwrap();
        graph
            .add(
                Pip::builder()
                    .semi_stable_hash(1)
                    .description("link")
                    .output_files(vec![out])
                    .build(),
            )
            .unwrap();
        let bin = graph.paths().find("/out/bin").unwrap();
        let root = graph.paths().find("/out").unwrap();
        assert_eq!(graph.graph_existence(out), PathExistence::ExistsAsFile);
        assert_eq!(graph.graph_existence(bin), PathExistence::ExistsAsDirectory);
        assert_eq!(graph.graph_existence(root), PathExistence::ExistsAsDirectory);
        assert_eq!(graph.graph_children(bin), vec![out]);
    }

    #[test]
    fn static_fingerprints_differ_by_declared_intent() {
        let graph = graph();
        let dep = graph.paths().intern("/src/a.c").unwrap();
        let a = graph
            .add(
                Pip::builder()
                    .semi_stable_hash(1)
                    .description("compile")
                    .file_dependencies(vec![dep])
                    .build(),
            )
            .unwrap();
        let b = graph
            .add(
                Pip::builder()
                    .semi_stable_hash(1)
                    .description("compile")
                    .build(),
            )
            .unwrap();
        let fp_a = graph.pip(a).unwrap().static_fingerprint;
        let fp_b = graph.pip(b).unwrap().static_fingerprint;
        assert_ne!(fp_a, fp_b);
    }

    #[test]
    fn seal_directory_pip_commits_the_seal() {
        let graph = graph();
        let root = graph.paths().intern("/src").unwrap();
        let member = graph.paths().intern("/src/a.c").unwrap();
        let (pip, artifact) = graph
            .add_seal_directory(
                root,
                SealKind::Full,
                [member].into_iter().collect(),
                None,
                42,
            )
            .unwrap();
        let seal = graph.seals().lookup(artifact).unwrap();
        assert_eq!(seal.producer, pip);
        assert!(seal.exposes(graph.paths(), member));
    }
}
