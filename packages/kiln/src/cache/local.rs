//! Local cache backend: SQLite metadata plus a filesystem CAS.
//!
//! The metadata database holds the two phase tables: path sets keyed by
//! weak fingerprint, and metadata records keyed by the full triple. The
//! CAS holds output content. Publication is idempotent by
//! `(weak, pathSetHash, strong)`.

use std::sync::{Arc, Mutex};

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use derive_more::Debug;
use futures::{Stream, stream};
use rusqlite::{Connection, params};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{
    hash::{PathSetHash, StrongFingerprint, WeakFingerprint},
    observe::pathset::ObservedPathSet,
};

use super::{
    backend::{CacheBackend, CacheMetadata},
    cas::FsCas,
};

/// Local two-phase cache store.
#[derive(Clone, Debug)]
pub struct LocalBackend {
    cas: FsCas,
    #[debug("<metadata>")]
    conn: Arc<Mutex<Connection>>,
}

impl LocalBackend {
    /// Open or create a local cache under `cache_dir`: CAS blobs in
    /// `{cache_dir}/cas/`, metadata in `{cache_dir}/metadata.db`.
    #[instrument(name = "LocalBackend::open")]
    pub async fn open(cache_dir: &str) -> Result<Self> {
        let cas = FsCas::open_dir(&format!("{cache_dir}/cas")).await?;
        let conn = Connection::open(format!("{cache_dir}/metadata.db"))
            .with_context(|| format!("open cache metadata in {cache_dir:?}"))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            cas,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// An in-memory metadata database with a temporary CAS, for tests.
    pub async fn in_memory(cas_dir: &str) -> Result<Self> {
        let cas = FsCas::open_dir(cas_dir).await?;
        let conn = Connection::open_in_memory().context("open in-memory metadata")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            cas,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn cas(&self) -> &FsCas {
        &self.cas
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS path_sets (
                weak TEXT NOT NULL,
                path_set_hash TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (weak, path_set_hash)
            );

            CREATE TABLE IF NOT EXISTS strong_entries (
                weak TEXT NOT NULL,
                path_set_hash TEXT NOT NULL,
                strong TEXT NOT NULL,
                metadata TEXT NOT NULL,
                PRIMARY KEY (weak, path_set_hash, strong)
            );
            "#,
        )
        .context("initialize cache schema")?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| eyre!("lock metadata: {e}"))
    }
}

impl CacheBackend for LocalBackend {
    #[instrument(name = "LocalBackend::query_path_sets", skip(self, cancel))]
    async fn query_path_sets(
        &self,
        weak: &WeakFingerprint,
        max_results: usize,
        cancel: &CancellationToken,
    ) -> Result<impl Stream<Item = Result<(PathSetHash, ObservedPathSet)>> + Send + Unpin> {
        if cancel.is_cancelled() {
            bail!("path set query cancelled");
        }
        let rows: Vec<(String, String)> = {
            let conn = self.lock()?;
            let mut statement = conn
                .prepare(
                    "SELECT path_set_hash, data FROM path_sets
                     WHERE weak = ?1 ORDER BY rowid DESC LIMIT ?2",
                )
                .context("prepare path set query")?;
            let mapped = statement
                .query_map(params![weak.to_string(), max_results as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .context("query path sets")?;
            mapped
                .collect::<Result<Vec<_>, _>>()
                .context("read path set rows")?
        };
        debug!(count = rows.len(), "path set candidates");
        let parsed = rows.into_iter().map(|(hash, data)| {
            let hash: PathSetHash = hash.parse()?;
            let path_set = ObservedPathSet::from_bytes(data.as_bytes())?;
            Ok((hash, path_set))
        });
        Ok(stream::iter(parsed))
    }

    #[instrument(name = "LocalBackend::query_strong_fingerprint", skip(self, cancel))]
    async fn query_strong_fingerprint(
        &self,
        weak: &WeakFingerprint,
        path_set_hash: &PathSetHash,
        strong: &StrongFingerprint,
        cancel: &CancellationToken,
    ) -> Result<Option<CacheMetadata>> {
        if cancel.is_cancelled() {
            bail!("strong fingerprint query cancelled");
        }
        let row: Option<String> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT metadata FROM strong_entries
                 WHERE weak = ?1 AND path_set_hash = ?2 AND strong = ?3",
                params![
                    weak.to_string(),
                    path_set_hash.to_string(),
                    strong.to_string()
                ],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("query strong entry")?
        };
        row.map(|data| serde_json::from_str(&data).context("parse cache metadata"))
            .transpose()
    }

    #[instrument(name = "LocalBackend::publish", skip_all)]
    async fn publish(
        &self,
        weak: &WeakFingerprint,
        path_set: &ObservedPathSet,
        metadata: &CacheMetadata,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            bail!("publish cancelled");
        }
        let path_set_hash = path_set.content_hash()?;
        let data = path_set.to_bytes()?;
        self.cas
            .store_keyed(&path_set_hash.to_string(), &data)
            .await?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO path_sets (weak, path_set_hash, data) VALUES (?1, ?2, ?3)",
            params![
                weak.to_string(),
                path_set_hash.to_string(),
                String::from_utf8(data).context("path set is not utf-8")?,
            ],
        )
        .context("insert path set")?;
        conn.execute(
            "INSERT OR IGNORE INTO strong_entries
             (weak, path_set_hash, strong, metadata) VALUES (?1, ?2, ?3, ?4)",
            params![
                weak.to_string(),
                path_set_hash.to_string(),
                metadata.strong_fingerprint.to_string(),
                serde_json::to_string(metadata).context("serialize metadata")?,
            ],
        )
        .context("insert strong entry")?;
        debug!(%weak, %path_set_hash, strong = %metadata.strong_fingerprint, "published");
        Ok(())
    }
}
