//! Diagnostic fingerprint store.
//!
//! When enabled, each pip's weak and strong fingerprints and their
//! constituents are appended as JSON lines, one record per lookup or
//! publication. The store exists purely for cache-miss analysis; nothing
//! in the engine reads it back.

use std::{
    io::Write,
    sync::Mutex,
};

use color_eyre::{Result, eyre::{Context, eyre}};
use serde::Serialize;
use tracing::instrument;

use crate::hash::{PathSetHash, StrongFingerprint, WeakFingerprint};

/// One fingerprint-store record.
#[derive(Debug, Serialize)]
pub struct FingerprintRecord<'a> {
    pub pip: &'a str,
    pub event: &'a str,
    pub weak: String,
    pub path_set_hash: Option<String>,
    pub strong: Option<String>,
    /// Free-form constituent description, e.g. observation counts.
    pub detail: &'a str,
}

/// Append-only JSONL sidecar.
#[derive(Debug)]
pub struct FingerprintStore {
    file: Mutex<std::fs::File>,
}

impl FingerprintStore {
    /// Open (or create) the store at `path`, appending to prior builds.
    #[instrument(name = "FingerprintStore::open")]
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create fingerprint store directory {parent:?}"))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open fingerprint store {path:?}"))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one record.
    pub fn record(
        &self,
        pip: &str,
        event: &str,
        weak: &WeakFingerprint,
        path_set_hash: Option<&PathSetHash>,
        strong: Option<&StrongFingerprint>,
        detail: &str,
    ) -> Result<()> {
        let record = FingerprintRecord {
            pip,
            event,
            weak: weak.to_string(),
            path_set_hash: path_set_hash.map(ToString::to_string),
            strong: strong.map(ToString::to_string),
            detail,
        };
        let mut line = serde_json::to_vec(&record).context("serialize fingerprint record")?;
        line.push(b'\n');
        let mut file = self.file.lock().map_err(|e| eyre!("lock store: {e}"))?;
        file.write_all(&line).context("append fingerprint record")?;
        Ok(())
    }
}
