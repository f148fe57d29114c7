//! The unifying content store: tracks which [`CacheSite`]s hold a hash,
//! serializes materialization per-hash, and replicates local stores to the
//! remote site inside the same critical section (§4.1: "`store` returns only
//! when both sites are populated").
//!
//! Grounded on the teacher's `CacheBackend` trait (`hurry/src/cache/
//! backend.rs`) for the shape of a storage abstraction spanning local and
//! remote tiers, and on the `SaveProgress`/`Restored` bookkeeping in
//! `hurry/src/cargo/cache/{save,restore}.rs` for transfer accounting.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bxl_types::error::{BuildError, CasOperation};
use bxl_types::{CacheSite, ContentHash, RealizationMode};
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{instrument, warn};

use crate::local::LocalCasSite;
use crate::remote::RemoteCasSite;

/// Where a `load_available` call found content, and how many bytes (if any)
/// were transferred to make it locally available.
#[derive(Clone, Debug, Default)]
pub struct LoadReport {
    pub available: HashMap<ContentHash, CacheSite>,
    pub bytes_transferred_remotely: u64,
    /// `"local"` / `"remote"`, for reporting — mirrors the teacher's
    /// `source-cache name` convention.
    pub source_cache_name: &'static str,
}

/// Open-stream result per §4.1's `open_stream(hash) -> read-stream | NotLocal
/// | NotFound`.
pub enum OpenStream {
    Found(Vec<u8>),
    NotLocal,
    NotFound,
}

/// The unifying two-site content store.
pub struct Store {
    local: LocalCasSite,
    remote: Option<RemoteCasSite>,
    sites: DashMap<ContentHash, CacheSite>,
    /// Per-hash lock for at-most-one-concurrent materialization/writes
    /// (spec §5: "a per-hash lock serializes writers").
    locks: DashMap<ContentHash, Arc<AsyncMutex<()>>>,
}

impl Store {
    pub fn new(local: LocalCasSite, remote: Option<RemoteCasSite>) -> Self {
        Self {
            local,
            remote,
            sites: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, hash: &ContentHash) -> Arc<AsyncMutex<()>> {
        self.locks.entry(*hash).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Compute the hash, write to the local site, and replicate to remote
    /// (when configured) inside the same critical section. If `known_hash`
    /// is supplied, verifies the computed hash matches it.
    #[instrument(skip(self, content))]
    pub async fn store(
        &self,
        content: &[u8],
        known_hash: Option<ContentHash>,
    ) -> Result<ContentHash, BuildError> {
        let hash = ContentHash::from_buffer(content);
        if let Some(known) = known_hash {
            if known != hash {
                return Err(BuildError::InvalidInput {
                    message: format!("content hash mismatch: expected {known}, computed {hash}"),
                });
            }
        }

        let lock = self.lock_for(&hash);
        let _guard = lock.lock().await;

        self.local.write_verified(&hash, content).await.map_err(|e| {
            BuildError::TransientIO {
                hash: Some(hash),
                operation: CasOperation::Store,
                source: format!("{e:#}"),
            }
        })?;
        let mut site = CacheSite::LOCAL;

        if let Some(remote) = &self.remote {
            remote
                .store(&hash, content.to_vec())
                .await
                .map_err(|e| BuildError::TransientIO {
                    hash: Some(hash),
                    operation: CasOperation::Store,
                    source: format!("{e:#}"),
                })?;
            site = site.union(CacheSite::REMOTE);
        }

        self.sites.insert(hash, site);
        Ok(hash)
    }

    /// For any hash present only at remote, transfer to local and record the
    /// transfer size.
    #[instrument(skip(self, hashes))]
    pub async fn load_available(&self, hashes: &[ContentHash]) -> Result<LoadReport, BuildError> {
        let mut report = LoadReport {
            source_cache_name: "local",
            ..Default::default()
        };

        for hash in hashes {
            if self.local.exists(hash).await.unwrap_or(false) {
                report.available.insert(*hash, CacheSite::LOCAL);
                continue;
            }

            let Some(remote) = &self.remote else {
                continue;
            };
            let lock = self.lock_for(hash);
            let _guard = lock.lock().await;
            // Re-check under the lock: another caller may have pulled it
            // down from remote already.
            if self.local.exists(hash).await.unwrap_or(false) {
                report.available.insert(*hash, CacheSite::LOCAL);
                continue;
            }

            match remote.read(hash).await {
                Ok(Some(bytes)) => {
                    let size = bytes.len() as u64;
                    if let Err(err) = self.local.write_verified(hash, &bytes).await {
                        warn!(%hash, ?err, "failed to cache remote content locally");
                        report.available.insert(*hash, CacheSite::REMOTE);
                        continue;
                    }
                    report.bytes_transferred_remotely += size;
                    report.source_cache_name = "remote";
                    self.sites
                        .entry(*hash)
                        .and_modify(|s| *s = s.union(CacheSite::LOCAL))
                        .or_insert(CacheSite::LOCAL);
                    report
                        .available
                        .insert(*hash, CacheSite::LOCAL | CacheSite::REMOTE);
                }
                Ok(None) => {}
                Err(err) => {
                    return Err(BuildError::TransientIO {
                        hash: Some(*hash),
                        operation: CasOperation::Load,
                        source: format!("{err:#}"),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Refuses when content is not on the local site — callers must first
    /// `load_available`.
    #[instrument(skip(self))]
    pub async fn open_stream(&self, hash: &ContentHash) -> OpenStream {
        match self.local.read_buffered(hash).await {
            Ok(Some(content)) => OpenStream::Found(content),
            Ok(None) => {
                if self
                    .remote
                    .as_ref()
                    .is_some_and(|_| self.find_sites(hash).is_remote())
                {
                    OpenStream::NotLocal
                } else {
                    OpenStream::NotFound
                }
            }
            Err(_) => OpenStream::NotFound,
        }
    }

    /// Deploys `hash` onto `target`, always removing the target path first.
    #[instrument(skip(self))]
    pub async fn materialize(
        &self,
        target: &Path,
        hash: &ContentHash,
        mode: RealizationMode,
    ) -> Result<(), BuildError> {
        let lock = self.lock_for(hash);
        let _guard = lock.lock().await;

        if !self.local.exists(hash).await.unwrap_or(false) {
            self.load_available(std::slice::from_ref(hash)).await?;
        }

        self.local
            .materialize(target, hash, mode)
            .await
            .map_err(|e| BuildError::TransientIO {
                hash: Some(*hash),
                operation: CasOperation::Materialize,
                source: format!("{e:#}"),
            })
    }

    /// Ingest an on-disk file into the CAS, preserving the realization
    /// relationship per the realization mode.
    #[instrument(skip(self))]
    pub async fn put(
        &self,
        source: &Path,
        known_hash: Option<&ContentHash>,
        mode: RealizationMode,
    ) -> Result<ContentHash, BuildError> {
        let hash = self
            .local
            .put(source, known_hash, mode)
            .await
            .map_err(|e| BuildError::TransientIO {
                hash: known_hash.copied(),
                operation: CasOperation::Put,
                source: format!("{e:#}"),
            })?;
        self.sites
            .entry(hash)
            .and_modify(|s| *s = s.union(CacheSite::LOCAL))
            .or_insert(CacheSite::LOCAL);
        Ok(hash)
    }

    /// Remove from the requested sites. The local site has no eviction
    /// mechanism implemented here beyond bookkeeping removal, mirroring
    /// spec §4.1's "if resulting sites are empty, drop the hash" at the
    /// index level (on-disk garbage collection is a separate concern, out
    /// of this core's scope).
    #[instrument(skip(self))]
    pub fn discard(&self, hash: &ContentHash, sites: CacheSite) {
        if let Some(mut entry) = self.sites.get_mut(hash) {
            *entry = entry.remove(sites);
            if entry.is_none() {
                drop(entry);
                self.sites.remove(hash);
            }
        }
    }

    pub fn find_sites(&self, hash: &ContentHash) -> CacheSite {
        self.sites.get(hash).map(|s| *s).unwrap_or(CacheSite::NONE)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    async fn store_local_only() -> (Store, tempfile::TempDir) {
        let temp = tempfile::tempdir().unwrap();
        let local = LocalCasSite::new(temp.path());
        (Store::new(local, None), temp)
    }

    #[tokio::test]
    async fn store_then_find_sites() {
        let (store, _temp) = store_local_only().await;
        let hash = store.store(b"content", None).await.unwrap();
        assert!(store.find_sites(&hash).is_local());
        assert!(!store.find_sites(&hash).is_remote());
    }

    #[tokio::test]
    async fn store_verifies_known_hash() {
        let (store, _temp) = store_local_only().await;
        let wrong = ContentHash::from_buffer(b"not the content");
        let result = store.store(b"content", Some(wrong)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn discard_removes_bookkeeping() {
        let (store, _temp) = store_local_only().await;
        let hash = store.store(b"content", None).await.unwrap();
        store.discard(&hash, CacheSite::LOCAL);
        assert!(store.find_sites(&hash).is_none());
    }

    #[tokio::test]
    async fn materialize_after_store() {
        let (store, temp) = store_local_only().await;
        let hash = store.store(b"payload", None).await.unwrap();
        let target = temp.path().join("materialized.txt");
        store
            .materialize(&target, &hash, RealizationMode::Copy)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"payload");
    }
}
