//! Flat filesystem content-addressed storage.
//!
//! The CAS is deliberately stupid: bytes in, bytes out, keyed by content
//! hash. It stores replayed output content and serialized path sets for
//! the local backend. No path details leak out; callers go through the
//! methods so the layout can change without touching them.

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use tracing::{instrument, trace};

use crate::hash::ContentHash;

/// Filesystem-backed CAS rooted at a single directory. Each entry is a
/// file named for the hex digest of its content.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[display("{root}")]
pub struct FsCas {
    root: String,
}

impl FsCas {
    /// Open an instance rooted at the provided directory, creating it if
    /// needed.
    #[instrument(name = "FsCas::open_dir")]
    pub async fn open_dir(root: &str) -> Result<Self> {
        tokio::fs::create_dir_all(root)
            .await
            .with_context(|| format!("create cas root {root:?}"))?;
        trace!(?root, "opened cas");
        Ok(Self {
            root: root.to_owned(),
        })
    }

    fn entry_path(&self, key: &str) -> String {
        format!("{}/{key}", self.root)
    }

    /// Store content under its own hash.
    #[instrument(name = "FsCas::store", skip_all)]
    pub async fn store(&self, content: &[u8]) -> Result<ContentHash> {
        let key = ContentHash::of_buffer(content);
        self.store_keyed(&hex::encode(key.digest()), content).await?;
        Ok(key)
    }

    /// Store content under an explicit hex key. Writes go through a
    /// temporary file so concurrent writers of the same key cannot tear.
    pub async fn store_keyed(&self, key: &str, content: &[u8]) -> Result<()> {
        static WRITE_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let seq = WRITE_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let dst = self.entry_path(key);
        let tmp = format!("{dst}.{}.{seq}.tmp", std::process::id());
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("write cas entry {tmp:?}"))?;
        tokio::fs::rename(&tmp, &dst)
            .await
            .with_context(|| format!("commit cas entry {dst:?}"))?;
        trace!(?key, bytes = content.len(), "stored cas entry");
        Ok(())
    }

    /// Fetch content by hex key, or `None` if absent.
    #[instrument(name = "FsCas::get_keyed", skip(self))]
    pub async fn get_keyed(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.entry_path(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read cas entry {key:?}")),
        }
    }

    /// Fetch content by content hash, or `None` if absent.
    pub async fn get(&self, key: &ContentHash) -> Result<Option<Vec<u8>>> {
        self.get_keyed(&hex::encode(key.digest())).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn store_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cas = FsCas::open_dir(&dir.path().to_string_lossy()).await.unwrap();
        let key = cas.store(b"payload").await.unwrap();
        assert_eq!(cas.get(&key).await.unwrap(), Some(b"payload".to_vec()));
    }

    #[tokio::test]
    async fn missing_entries_are_none() {
        let dir = tempfile::tempdir().unwrap();
        let cas = FsCas::open_dir(&dir.path().to_string_lossy()).await.unwrap();
        let key = ContentHash::of_buffer(b"never stored");
        assert_eq!(cas.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn storing_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cas = FsCas::open_dir(&dir.path().to_string_lossy()).await.unwrap();
        let a = cas.store(b"same").await.unwrap();
        let b = cas.store(b"same").await.unwrap();
        assert_eq!(a, b);
    }
}
