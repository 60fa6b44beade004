//! Pip records: the unit of scheduled work.
//!
//! A pip declares its intent (inputs, outputs, sealed directory
//! dependencies, tags, options) and the engine holds it to that intent at
//! runtime. Pips are immutable once added to the graph; the graph assigns
//! their id and static fingerprint at add time.

use std::sync::Arc;

use bon::Builder;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use strum::Display as StrumDisplay;

use crate::{
    hash::StaticFingerprint,
    observe::reclassify::ReclassificationRule,
    path::PathId,
    seal::DirectoryArtifact,
};

/// Identifier of a pip within the graph. Assigned monotonically at add time
/// and never reused.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("Pip{_0}")]
pub struct PipId(pub u32);

/// The kind of work a pip performs.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, StrumDisplay, Serialize, Deserialize)]
pub enum PipKind {
    Process,
    CopyFile,
    WriteFile,
    Ipc,
    SealDirectory,
    Value,
    SpecFile,
    Module,
}

/// Per-pip toggles that influence observation typing and policy.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct PipOptions {
    /// Permit reads of paths that are not declared anywhere, as long as they
    /// are not produced by another pip. Such reads are recorded and become
    /// part of the fingerprint rather than policy violations.
    pub allow_undeclared_source_reads: bool,

    /// Treat this pip's directory enumerations under search-path semantics
    /// by default (PATH-like tool directories).
    pub search_path_enumeration: bool,

    /// Rewrites of existing source files by this pip are expected and
    /// should not be excluded from alien-file enumeration.
    pub allows_source_rewrites: bool,
}

/// A pip's immutable declared intent.
///
/// `id` and `static_fingerprint` are placeholders until
/// [`PipGraph::add`](crate::graph::PipGraph) accepts the pip.
#[derive(Clone, Debug, Builder)]
pub struct Pip {
    #[builder(default = PipKind::Process)]
    pub kind: PipKind,

    /// A 64-bit hash of the pip's provenance, stable across builds of the
    /// same specification. Used for human-facing identification.
    pub semi_stable_hash: u64,

    /// Short description for diagnostics, e.g. the tool name.
    #[builder(into)]
    pub description: String,

    /// Declared single-file dependencies.
    #[builder(default)]
    pub file_dependencies: Vec<PathId>,

    /// Declared sealed-directory dependencies.
    #[builder(default)]
    pub directory_dependencies: Vec<DirectoryArtifact>,

    /// Declared output files.
    #[builder(default)]
    pub output_files: Vec<PathId>,

    /// Declared opaque output directory roots.
    #[builder(default)]
    pub output_directories: Vec<DirectoryArtifact>,

    /// Ids of pips this pip depends on in addition to producer edges implied
    /// by its file dependencies (e.g. ordering-only edges).
    #[builder(default)]
    pub explicit_dependencies: Vec<PipId>,

    #[builder(default)]
    pub tags: Vec<String>,

    #[builder(default)]
    pub options: PipOptions,

    /// Pip-specific reclassification rules, applied before global rules.
    #[builder(default)]
    pub reclassification_rules: Vec<Arc<ReclassificationRule>>,
}

impl Pip {
    /// Human-facing identifier: `Pip` + the semi-stable hash in hex, the way
    /// operators see pips in logs and error messages.
    pub fn display_name(&self) -> String {
        format!("Pip{:016X}", self.semi_stable_hash)
    }
}

/// A pip as stored in the graph: the declared intent plus the identity the
/// graph assigned.
#[derive(Clone, Debug)]
pub struct GraphPip {
    pub id: PipId,
    pub static_fingerprint: StaticFingerprint,
    pub pip: Arc<Pip>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn display_name_uses_semi_stable_hash() {
        let pip = Pip::builder()
            .semi_stable_hash(0xDEAD_BEEF)
            .description("cl.exe")
            .build();
        assert_eq!(pip.display_name(), "Pip00000000DEADBEEF");
    }
}
