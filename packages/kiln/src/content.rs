//! File-content manager: hashing with per-build memoization and a
//! cross-build persisted table.
//!
//! Pass 1 of observed-input processing issues independent, concurrent
//! queries here. A query consults, in order: the per-build memo, mount
//! policy (non-hashable mounts answer `UNTRACKED_FILE` without touching
//! content), the persisted `(path, on-disk identity) -> hash` table, and
//! finally the disk. Persisted entries expire after a configurable number
//! of builds.

use std::sync::{Arc, Mutex};

use color_eyre::{Result, eyre::{Context, bail, eyre}};
use dashmap::DashMap;
use rusqlite::{Connection, params};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::{
    error::EngineError,
    fs::{self, FileContentInfo, FileIdentity, PathExistence, ReparseKind},
    hash::ContentHash,
    mount::MountTable,
    path::{PathId, PathTable},
};

/// Shared content-query surface for observed-input processing.
#[derive(Debug, Clone)]
pub struct FileContentManager {
    paths: Arc<PathTable>,
    mounts: Arc<MountTable>,
    memo: Arc<DashMap<PathId, FileContentInfo>>,
    store: Option<Arc<Mutex<ContentStore>>>,
}

impl FileContentManager {
    /// A manager with no cross-build persistence.
    pub fn in_memory(paths: Arc<PathTable>, mounts: Arc<MountTable>) -> Self {
        Self {
            paths,
            mounts,
            memo: Arc::new(DashMap::new()),
            store: None,
        }
    }

    /// A manager persisting the file-content table at `db_path`.
    ///
    /// Opening counts as a new build: the build sequence number advances and
    /// entries unused for `ttl_builds` builds are purged.
    pub fn open(
        paths: Arc<PathTable>,
        mounts: Arc<MountTable>,
        db_path: &str,
        ttl_builds: u32,
    ) -> Result<Self> {
        let store = ContentStore::open(db_path, ttl_builds)?;
        Ok(Self {
            paths,
            mounts,
            memo: Arc::new(DashMap::new()),
            store: Some(Arc::new(Mutex::new(store))),
        })
    }

    /// Record content the scheduler already knows, e.g. outputs replayed
    /// from cache. Later queries answer from the memo without probing.
    pub fn report_known_content(&self, path: PathId, hash: ContentHash, length: u64) {
        self.memo.insert(
            path,
            FileContentInfo {
                hash,
                length: Some(length),
                existence: PathExistence::ExistsAsFile,
                reparse: ReparseKind::None,
            },
        );
    }

    /// Resolve content info for a path. Queries are independent and may run
    /// concurrently; each result is memoized for the build.
    #[instrument(skip(self, cancel), fields(path = %self.paths.expand(path)))]
    pub async fn query(
        &self,
        path: PathId,
        cancel: &CancellationToken,
    ) -> Result<FileContentInfo> {
        if let Some(info) = self.memo.get(&path) {
            return Ok(*info);
        }
        if cancel.is_cancelled() {
            bail!("content query cancelled");
        }

        let expanded = self.paths.expand(path);
        let info = if !self.mounts.is_hashable(&self.paths, path) {
            let existence = fs::probe(&expanded).await?;
            match existence {
                PathExistence::Nonexistent => FileContentInfo::absent(),
                _ => FileContentInfo::untracked(existence),
            }
        } else {
            self.query_hashable(path, &expanded, cancel).await?
        };

        self.memo.insert(path, info);
        Ok(info)
    }

    async fn query_hashable(
        &self,
        path: PathId,
        expanded: &str,
        cancel: &CancellationToken,
    ) -> Result<FileContentInfo> {
        let Some(identity) = fs::identity(expanded).await? else {
            return Ok(FileContentInfo::absent());
        };
        let existence = fs::probe(expanded).await?;
        if existence == PathExistence::ExistsAsDirectory {
            return Ok(FileContentInfo {
                hash: ContentHash::ABSENT_FILE,
                length: None,
                existence,
                reparse: ReparseKind::None,
            });
        }
        let reparse = fs::probe_reparse(expanded).await?;

        if let Some(hash) = self.lookup_persisted(expanded, &identity)? {
            trace!(%path, %hash, "content table hit");
            return Ok(FileContentInfo {
                hash,
                length: Some(identity.length),
                existence,
                reparse,
            });
        }

        if cancel.is_cancelled() {
            bail!("content query cancelled");
        }
        let (hash, length) = fs::hash_file(expanded).await.map_err(|err| {
            eyre!(EngineError::HashFailure {
                path: expanded.to_owned(),
                reason: format!("{err:#}"),
                retryable: true,
            })
        })?;
        self.record_persisted(expanded, &identity, &hash)?;
        Ok(FileContentInfo {
            hash,
            length: Some(length),
            existence,
            reparse,
        })
    }

    fn lookup_persisted(
        &self,
        expanded: &str,
        identity: &FileIdentity,
    ) -> Result<Option<ContentHash>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let store = store.lock().map_err(|e| eyre!("lock content store: {e}"))?;
        store.lookup(expanded, identity)
    }

    fn record_persisted(
        &self,
        expanded: &str,
        identity: &FileIdentity,
        hash: &ContentHash,
    ) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let store = store.lock().map_err(|e| eyre!("lock content store: {e}"))?;
        store.record(expanded, identity, hash)
    }
}

/// SQLite persistence for the file-content table.
#[derive(Debug)]
struct ContentStore {
    conn: Connection,
    build_seq: u64,
}

impl ContentStore {
    fn open(db_path: &str, ttl_builds: u32) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create content table directory {parent:?}"))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open content table at {db_path:?}"))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS file_content (
                path TEXT PRIMARY KEY,
                mtime_nanos TEXT NOT NULL,
                length INTEGER NOT NULL,
                hash TEXT NOT NULL,
                last_used_build INTEGER NOT NULL
            );
            "#,
        )
        .context("initialize content table schema")?;

        let build_seq: u64 = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'build_seq'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|v| v as u64 + 1)
            .unwrap_or(1);
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('build_seq', ?1)",
            params![build_seq as i64],
        )
        .context("advance build sequence")?;

        let purged = conn
            .execute(
                "DELETE FROM file_content WHERE last_used_build + ?1 < ?2",
                params![ttl_builds as i64, build_seq as i64],
            )
            .context("purge expired content entries")?;
        if purged > 0 {
            debug!(purged, build_seq, "expired content table entries");
        }

        Ok(Self { conn, build_seq })
    }

    fn lookup(&self, path: &str, identity: &FileIdentity) -> Result<Option<ContentHash>> {
        let row = self
            .conn
            .query_row(
                "SELECT mtime_nanos, length, hash FROM file_content WHERE path = ?1",
                params![path],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("query content table")?;

        let Some((mtime, length, hash)) = row else {
            return Ok(None);
        };
        if mtime != identity.mtime_nanos.to_string() || length as u64 != identity.length {
            return Ok(None);
        }
        let hash: ContentHash = hash.parse().context("parse persisted hash")?;
        self.conn
            .execute(
                "UPDATE file_content SET last_used_build = ?1 WHERE path = ?2",
                params![self.build_seq as i64, path],
            )
            .context("touch content entry")?;
        Ok(Some(hash))
    }

    fn record(&self, path: &str, identity: &FileIdentity, hash: &ContentHash) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT OR REPLACE INTO file_content
                (path, mtime_nanos, length, hash, last_used_build)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    path,
                    identity.mtime_nanos.to_string(),
                    identity.length as i64,
                    hash.to_string(),
                    self.build_seq as i64,
                ],
            )
            .context("record content entry")?;
        Ok(())
    }
}
