//! The persisted path set: the canonical record of everything a pip
//! looked at, and the middle term of two-phase caching.
//!
//! Path sets are serialized as JSON with a version tag. The serialized
//! form is canonical (entries sorted by expanded path, accessed names
//! sorted) so the path-set hash is stable across hosts of the same
//! family.

use color_eyre::{Result, eyre::{Context, bail}};
use serde::{Deserialize, Serialize};

use crate::{
    hash::PathSetHash,
    path::{PathId, PathTable},
};

use super::ObservationFlags;

/// On-disk format version. Bump when the serialized shape changes.
pub const PATH_SET_FORMAT_VERSION: u32 = 1;

/// One observed path with the flags it was observed under.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct PathSetEntry {
    pub path: String,
    pub flags: ObservationFlags,
    /// Pattern the enumeration was filtered by, when one applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enumerate_pattern: Option<String>,
}

/// The canonical, ordered record of a pip's observed accesses.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ObservedPathSet {
    pub version: u32,
    /// Entries sorted by expanded path. Duplicates are tolerated on input
    /// and removed here.
    pub entries: Vec<PathSetEntry>,
    /// Sorted file-name atoms the pip referenced anywhere.
    pub accessed_names: Vec<String>,
    /// The unsafe-options tag the observations were typed under.
    pub unsafe_options: String,
}

impl ObservedPathSet {
    /// Build a canonical path set from already-sorted entries.
    pub fn new(
        mut entries: Vec<PathSetEntry>,
        mut accessed_names: Vec<String>,
        unsafe_options: String,
    ) -> Self {
        entries.dedup_by(|a, b| a.path == b.path && a.flags == b.flags);
        accessed_names.sort();
        accessed_names.dedup();
        Self {
            version: PATH_SET_FORMAT_VERSION,
            entries,
            accessed_names,
            unsafe_options,
        }
    }

    /// The canonical serialized form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("serialize path set")
    }

    /// Parse a serialized path set, rejecting unknown versions.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let parsed: Self = serde_json::from_slice(bytes).context("parse path set")?;
        if parsed.version != PATH_SET_FORMAT_VERSION {
            bail!(
                "unsupported path set version {} (expected {PATH_SET_FORMAT_VERSION})",
                parsed.version
            );
        }
        Ok(parsed)
    }

    /// Digest of the canonical serialized form.
    pub fn content_hash(&self) -> Result<PathSetHash> {
        let bytes = self.to_bytes()?;
        Ok(PathSetHash(*blake3::hash(&bytes).as_bytes()))
    }

    /// Re-intern the entries for reprocessing during cache lookup.
    pub fn intern_entries(&self, paths: &PathTable) -> Result<Vec<(PathId, PathSetEntry)>> {
        self.entries
            .iter()
            .map(|entry| Ok((paths.intern(&entry.path)?, entry.clone())))
            .collect()
    }
}
