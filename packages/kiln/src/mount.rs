//! Named mounts: configured subtrees with filesystem policy.
//!
//! Every policy decision about a path starts from the innermost mount
//! containing it: whether the path may be read, written, hashed into
//! fingerprints, or may contain build outputs. Paths outside every mount
//! have no policy and are treated as untracked.

use bon::Builder;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};

use crate::path::{PathId, PathTable};

/// A configured subtree of the filesystem.
#[derive(Clone, Debug, Builder, Serialize, Deserialize)]
pub struct Mount {
    #[builder(into)]
    pub name: String,
    pub root: PathId,
    #[builder(default = true)]
    pub readable: bool,
    #[builder(default)]
    pub writable: bool,
    /// Content under this mount may be hashed into fingerprints. Reading a
    /// file under a non-hashable mount aborts the pip.
    #[builder(default = true)]
    pub hashable: bool,
    /// Whether build outputs may land under this mount. Writable mounts
    /// always may; read-only mounts may opt in for pre-populated outputs.
    #[builder(default)]
    pub may_contain_outputs: bool,
}

impl Mount {
    pub fn allows_outputs(&self) -> bool {
        self.writable || self.may_contain_outputs
    }
}

/// Registry of mounts plus globally untracked scopes.
#[derive(Debug, Default)]
pub struct MountTable {
    mounts: Vec<Mount>,
    untracked_scopes: DashSet<PathId>,
}

impl MountTable {
    pub fn new(mounts: Vec<Mount>) -> Self {
        Self {
            mounts,
            untracked_scopes: DashSet::new(),
        }
    }

    /// Declare a scope whose accesses are invisible to fingerprinting.
    pub fn add_untracked_scope(&self, root: PathId) {
        self.untracked_scopes.insert(root);
    }

    /// The innermost mount containing `path`, if any.
    pub fn mount_containing(&self, table: &PathTable, path: PathId) -> Option<&Mount> {
        self.mounts
            .iter()
            .filter(|m| table.is_within(path, m.root))
            .max_by_key(|m| table.depth(m.root))
    }

    /// Whether `path` lies under a globally untracked scope.
    pub fn is_untracked(&self, table: &PathTable, path: PathId) -> bool {
        table
            .hierarchy(path)
            .any(|ancestor| self.untracked_scopes.contains(&ancestor))
    }

    /// Whether content at `path` may be hashed into fingerprints.
    pub fn is_hashable(&self, table: &PathTable, path: PathId) -> bool {
        !self.is_untracked(table, path)
            && self
                .mount_containing(table, path)
                .is_some_and(|m| m.hashable && m.readable)
    }

    /// Whether build outputs may appear under `path`.
    pub fn may_contain_outputs(&self, table: &PathTable, path: PathId) -> bool {
        self.mount_containing(table, path)
            .is_some_and(Mount::allows_outputs)
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }
}
