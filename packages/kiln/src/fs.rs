//! Real-filesystem probes tailored to the engine.
//!
//! All disk access funnels through this module so that views and the
//! content manager can reason about what actually touched the disk. Probes
//! use `symlink_metadata` so that reparse points are observed as
//! themselves; [`probe_reparse`] resolves one level to learn what a link
//! points at.

use std::time::SystemTime;

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::hash::ContentHash;

/// Existence of a path as seen by some view.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    strum::Display,
    Default,
    Serialize,
    Deserialize,
)]
pub enum PathExistence {
    #[default]
    Nonexistent,
    ExistsAsFile,
    ExistsAsDirectory,
}

impl PathExistence {
    pub fn exists(self) -> bool {
        self != Self::Nonexistent
    }
}

/// What a reparse point (symlink, junction) resolves to.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Serialize, Deserialize)]
pub enum ReparseKind {
    #[default]
    None,
    FileSymlink,
    /// A symlink or junction whose target is a directory. Observations on
    /// such paths are treated as directory observations even though the
    /// link itself is a file.
    DirectorySymlink,
}

/// Everything the content manager learned about a path.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct FileContentInfo {
    pub hash: ContentHash,
    pub length: Option<u64>,
    pub existence: PathExistence,
    pub reparse: ReparseKind,
}

impl FileContentInfo {
    /// Info for a path that does not exist.
    pub fn absent() -> Self {
        Self {
            hash: ContentHash::ABSENT_FILE,
            length: None,
            existence: PathExistence::Nonexistent,
            reparse: ReparseKind::None,
        }
    }

    /// Info for a file under a non-hashable mount.
    pub fn untracked(existence: PathExistence) -> Self {
        Self {
            hash: ContentHash::UNTRACKED_FILE,
            length: None,
            existence,
            reparse: ReparseKind::None,
        }
    }
}

/// On-disk identity used to key the persisted file-content table. If the
/// identity is unchanged since a prior build, the recorded hash is reused
/// without re-reading the file.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct FileIdentity {
    pub mtime_nanos: i128,
    pub length: u64,
}

/// Probe existence without following symlinks.
pub async fn probe(path: &str) -> Result<PathExistence> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(PathExistence::ExistsAsDirectory),
        Ok(_) => Ok(PathExistence::ExistsAsFile),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(PathExistence::Nonexistent),
        Err(err) => Err(err).context(format!("probe {path:?}")),
    }
}

/// Resolve what a path's reparse point (if any) points at.
pub async fn probe_reparse(path: &str) -> Result<ReparseKind> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(ReparseKind::None),
        Err(err) => return Err(err).context(format!("probe reparse {path:?}")),
    };
    if !meta.file_type().is_symlink() {
        return Ok(ReparseKind::None);
    }
    match tokio::fs::metadata(path).await {
        Ok(target) if target.is_dir() => Ok(ReparseKind::DirectorySymlink),
        Ok(_) => Ok(ReparseKind::FileSymlink),
        // Dangling link: the link itself is still a file.
        Err(_) => Ok(ReparseKind::FileSymlink),
    }
}

/// Read a file's on-disk identity, or `None` if it does not exist.
pub async fn identity(path: &str) -> Result<Option<FileIdentity>> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).context(format!("stat {path:?}")),
    };
    let mtime = meta
        .modified()
        .context("mtime unavailable")?
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i128)
        .unwrap_or_default();
    Ok(Some(FileIdentity {
        mtime_nanos: mtime,
        length: meta.len(),
    }))
}

/// When the entry at `path` was last modified, as a Unix timestamp.
///
/// Alien-file enumeration uses this to drop files that appeared after the
/// build started.
pub async fn modified_at(path: &str) -> Result<Option<jiff::Timestamp>> {
    let Some(identity) = identity(path).await? else {
        return Ok(None);
    };
    let seconds = (identity.mtime_nanos / 1_000_000_000) as i64;
    let nanos = (identity.mtime_nanos % 1_000_000_000) as i32;
    Ok(jiff::Timestamp::new(seconds, nanos).ok())
}

/// Enumerate the immediate children of a directory as `(name, existence)`
/// pairs. A nonexistent directory enumerates as empty.
pub async fn enumerate(path: &str) -> Result<Vec<(String, PathExistence)>> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) if err.kind() == std::io::ErrorKind::NotADirectory => return Ok(Vec::new()),
        Err(err) => return Err(err).context(format!("enumerate {path:?}")),
    };
    let mut children = Vec::new();
    while let Some(entry) = entries.next_entry().await.context("read dir entry")? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let kind = match entry.file_type().await {
            Ok(t) if t.is_dir() => PathExistence::ExistsAsDirectory,
            Ok(_) => PathExistence::ExistsAsFile,
            Err(_) => PathExistence::ExistsAsFile,
        };
        children.push((name, kind));
    }
    trace!(?path, count = children.len(), "enumerated directory");
    Ok(children)
}

/// Hash the file's content. Hashing runs on the blocking pool; large files
/// stream through the hasher instead of loading into memory.
pub async fn hash_file(path: &str) -> Result<(ContentHash, u64)> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path).with_context(|| format!("open {path:?}"))?;
        let mut reader = std::io::BufReader::new(file);
        let mut hasher = blake3::Hasher::new();
        let bytes =
            std::io::copy(&mut reader, &mut hasher).with_context(|| format!("read {path:?}"))?;
        let hash = if bytes == 0 {
            ContentHash::EMPTY_FILE
        } else {
            ContentHash::from_digest(*hasher.finalize().as_bytes())
        };
        trace!(?path, %hash, ?bytes, "hashed file");
        Ok((hash, bytes))
    })
    .await
    .context("join hashing task")?
}
