//! Interned absolute paths and hierarchy queries.
//!
//! Every path the engine touches is interned once into a [`PathTable`] and
//! referred to by its compact [`PathId`] afterwards. Identifiers are
//! componentwise: a path id names a `(parent, name-atom)` pair, so `parent`
//! and `name` are constant-time and `is_within` walks at most the depth of
//! the descendant. Identifiers live for the process lifetime and are never
//! reused.
//!
//! Name atoms are interned separately so that the accessed-file-name sets
//! carried by path sets stay compact, and so that search-path enumeration
//! filters can compare names without rebuilding strings.

use std::{
    cmp::Ordering,
    sync::RwLock,
};

use color_eyre::{Result, eyre::bail};
use dashmap::DashMap;
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Identifier of an interned absolute path.
///
/// Equality of identifiers is equality of the textual path under the
/// table's case sensitivity. Ordering of the raw integer is insertion
/// order and carries no meaning; use [`PathTable::cmp_expanded`] for the
/// canonical expanded-path order.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("Path#{_0}")]
pub struct PathId(u32);

/// Identifier of an interned path component name.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("Atom#{_0}")]
pub struct NameAtom(u32);

/// How path text is compared on this host.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, strum::EnumString, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum CaseSensitivity {
    #[cfg_attr(not(any(target_os = "windows", target_os = "macos")), default)]
    Sensitive,
    #[cfg_attr(any(target_os = "windows", target_os = "macos"), default)]
    Insensitive,
}

impl CaseSensitivity {
    /// The comparison appropriate for the host operating system.
    pub fn host() -> Self {
        Self::default()
    }

    fn normalize(self, name: &str) -> String {
        match self {
            Self::Sensitive => name.to_owned(),
            Self::Insensitive => name.to_lowercase(),
        }
    }

    /// Compare two component names under this comparator.
    pub fn cmp_names(self, a: &str, b: &str) -> Ordering {
        match self {
            Self::Sensitive => a.cmp(b),
            Self::Insensitive => a.to_lowercase().cmp(&b.to_lowercase()),
        }
    }
}

#[derive(Debug)]
struct PathNode {
    parent: Option<PathId>,
    name: NameAtom,
    depth: u32,
}

/// Bidirectional mapping between textual absolute paths and [`PathId`]s.
///
/// Internally synchronized; interning and queries may run concurrently from
/// any thread. Interning fails only on malformed input (a relative path);
/// expansion never fails for a valid id.
#[derive(Debug)]
pub struct PathTable {
    sensitivity: CaseSensitivity,
    nodes: RwLock<Vec<PathNode>>,
    // (parent, normalized child name) -> child id
    children: DashMap<(PathId, String), PathId>,
    atoms: RwLock<Vec<String>>,
    atom_index: DashMap<String, NameAtom>,
}

impl PathTable {
    /// Create a table using the host-appropriate comparator.
    pub fn new() -> Self {
        Self::with_sensitivity(CaseSensitivity::host())
    }

    /// Create a table with an explicit comparator.
    pub fn with_sensitivity(sensitivity: CaseSensitivity) -> Self {
        let root_atom = NameAtom(0);
        let table = Self {
            sensitivity,
            nodes: RwLock::new(vec![PathNode {
                parent: None,
                name: root_atom,
                depth: 0,
            }]),
            children: DashMap::new(),
            atoms: RwLock::new(vec![String::new()]),
            atom_index: DashMap::new(),
        };
        table.atom_index.insert(String::new(), root_atom);
        table
    }

    /// The comparator the table was created with.
    pub fn sensitivity(&self) -> CaseSensitivity {
        self.sensitivity
    }

    /// The root of the filesystem, parent of all interned paths.
    pub fn root(&self) -> PathId {
        PathId(0)
    }

    /// Intern a name atom.
    pub fn intern_name(&self, name: &str) -> NameAtom {
        let key = self.sensitivity.normalize(name);
        if let Some(atom) = self.atom_index.get(&key) {
            return *atom;
        }
        let mut atoms = self.atoms.write().expect("atom table poisoned");
        // Double-check under the write lock: another thread may have won.
        if let Some(atom) = self.atom_index.get(&key) {
            return *atom;
        }
        let atom = NameAtom(atoms.len() as u32);
        atoms.push(name.to_owned());
        self.atom_index.insert(key, atom);
        atom
    }

    /// The textual form of a name atom, in first-seen casing.
    pub fn name_str(&self, atom: NameAtom) -> String {
        self.atoms.read().expect("atom table poisoned")[atom.0 as usize].clone()
    }

    /// Intern an absolute path.
    pub fn intern(&self, path: &str) -> Result<PathId> {
        if !path.starts_with('/') {
            bail!("cannot intern relative path: {path:?}");
        }
        let mut current = self.root();
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            current = self.intern_child(current, component);
        }
        Ok(current)
    }

    /// Intern a single child component under an existing path.
    pub fn intern_child(&self, parent: PathId, name: &str) -> PathId {
        let key = (parent, self.sensitivity.normalize(name));
        if let Some(child) = self.children.get(&key) {
            return *child;
        }
        let atom = self.intern_name(name);
        let mut nodes = self.nodes.write().expect("path table poisoned");
        if let Some(child) = self.children.get(&key) {
            return *child;
        }
        let depth = nodes[parent.0 as usize].depth + 1;
        let child = PathId(nodes.len() as u32);
        nodes.push(PathNode {
            parent: Some(parent),
            name: atom,
            depth,
        });
        self.children.insert(key, child);
        child
    }

    /// Look up a path without interning it. Returns `None` if the path has
    /// never been interned.
    pub fn find(&self, path: &str) -> Option<PathId> {
        if !path.starts_with('/') {
            return None;
        }
        let mut current = self.root();
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            let key = (current, self.sensitivity.normalize(component));
            current = *self.children.get(&key)?;
        }
        Some(current)
    }

    /// The parent of a path, or `None` for the root.
    pub fn parent(&self, id: PathId) -> Option<PathId> {
        self.nodes.read().expect("path table poisoned")[id.0 as usize].parent
    }

    /// The final component of a path.
    pub fn name(&self, id: PathId) -> NameAtom {
        self.nodes.read().expect("path table poisoned")[id.0 as usize].name
    }

    /// Depth of the path below the root.
    pub fn depth(&self, id: PathId) -> u32 {
        self.nodes.read().expect("path table poisoned")[id.0 as usize].depth
    }

    /// Whether `id` equals `ancestor` or lies anywhere below it.
    pub fn is_within(&self, id: PathId, ancestor: PathId) -> bool {
        let nodes = self.nodes.read().expect("path table poisoned");
        let target_depth = nodes[ancestor.0 as usize].depth;
        let mut current = id;
        loop {
            let node = &nodes[current.0 as usize];
            if node.depth < target_depth {
                return false;
            }
            if current == ancestor {
                return true;
            }
            match node.parent {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Iterate the hierarchy bottom-up: the path itself, then each parent,
    /// ending just above the root.
    pub fn hierarchy(&self, id: PathId) -> impl Iterator<Item = PathId> + '_ {
        let mut current = Some(id);
        std::iter::from_fn(move || {
            let id = current?;
            if id == self.root() {
                return None;
            }
            current = self.parent(id);
            Some(id)
        })
    }

    /// Expand an id back into its textual absolute path.
    pub fn expand(&self, id: PathId) -> String {
        if id == self.root() {
            return "/".to_owned();
        }
        let mut atoms = Vec::new();
        let nodes = self.nodes.read().expect("path table poisoned");
        let mut current = id;
        while let Some(parent) = nodes[current.0 as usize].parent {
            atoms.push(nodes[current.0 as usize].name);
            current = parent;
        }
        drop(nodes);
        let names = self.atoms.read().expect("atom table poisoned");
        let mut out = String::new();
        for atom in atoms.into_iter().rev() {
            out.push('/');
            out.push_str(&names[atom.0 as usize]);
        }
        out
    }

    /// Compare two paths in canonical expanded-path order under the table's
    /// comparator. This is the order used for path sets, typed observation
    /// sequences, and parent-before-child elision.
    pub fn cmp_expanded(&self, a: PathId, b: PathId) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        let chain_a = self.component_chain(a);
        let chain_b = self.component_chain(b);
        let names = self.atoms.read().expect("atom table poisoned");
        for (atom_a, atom_b) in chain_a.iter().zip(chain_b.iter()) {
            if atom_a == atom_b {
                continue;
            }
            let ord = self
                .sensitivity
                .cmp_names(&names[atom_a.0 as usize], &names[atom_b.0 as usize]);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        chain_a.len().cmp(&chain_b.len())
    }

    /// Sort a slice of ids into canonical expanded-path order.
    pub fn sort_expanded(&self, ids: &mut [PathId]) {
        ids.sort_by(|a, b| self.cmp_expanded(*a, *b));
    }

    fn component_chain(&self, id: PathId) -> Vec<NameAtom> {
        let nodes = self.nodes.read().expect("path table poisoned");
        let mut chain = Vec::with_capacity(nodes[id.0 as usize].depth as usize);
        let mut current = id;
        while let Some(parent) = nodes[current.0 as usize].parent {
            chain.push(nodes[current.0 as usize].name);
            current = parent;
        }
        chain.reverse();
        chain
    }
}

impl Default for PathTable {
    fn default() -> Self {
        Self::new()
    }
}
