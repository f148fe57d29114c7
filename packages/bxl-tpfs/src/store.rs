//! The unifying TPFS facade: local index plus an optional remote index,
//! with the per-weak-fingerprint publish lock from spec §5's locking
//! discipline ("TPFS uses a short per-weak-fingerprint lock during
//! publish").
//!
//! Mirrors `bxl-cas::store::Store`'s shape: a `DashMap` of per-key locks
//! guarding a critical section that touches both sites.

use std::collections::HashSet;
use std::sync::Arc;

use bxl_types::fingerprint::PathSetHash;
use bxl_types::{CacheEntry, StrongFingerprint, WeakFingerprint};
use color_eyre::Result;
use dashmap::DashMap;
use futures::Stream;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{instrument, warn};

use crate::local::LocalTpfs;
use crate::remote::RemoteTpfs;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PublishMode {
    /// Fail with `Conflict` if an entry already exists for the triple.
    CreateNew,
    /// Always overwrite; never conflicts.
    CreateOrReplace,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PublishResult {
    Published,
    Conflict(CacheEntry),
}

/// See `LocalTpfs::get_entry`'s doc comment for why "never published" and
/// "published then evicted" collapse to the same `Absent` variant.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum EntryLookup {
    Hit(CacheEntry),
    Absent,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TpfsCandidate {
    pub path_set_hash: PathSetHash,
    pub strong_fingerprint: StrongFingerprint,
}

pub struct Store {
    local: LocalTpfs,
    remote: Option<RemoteTpfs>,
    publish_locks: DashMap<WeakFingerprint, Arc<AsyncMutex<()>>>,
}

impl Store {
    pub fn new(local: LocalTpfs, remote: Option<RemoteTpfs>) -> Self {
        Self {
            local,
            remote,
            publish_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, weak_fp: WeakFingerprint) -> Arc<AsyncMutex<()>> {
        self.publish_locks
            .entry(weak_fp)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Candidates known locally, merged with any the remote knows about that
    /// the local index hasn't seen yet. Order is unspecified (spec §4.2).
    #[instrument(name = "Store::list_by_weak", skip(self))]
    pub async fn list_by_weak(
        &self,
        weak_fp: WeakFingerprint,
    ) -> Result<impl Stream<Item = TpfsCandidate> + use<>> {
        let mut seen = HashSet::new();
        let mut candidates = self.local.list_by_weak(weak_fp).await?;
        seen.extend(candidates.iter().copied());

        if let Some(remote) = &self.remote {
            match remote.list_by_weak(weak_fp).await {
                Ok(remote_candidates) => {
                    for candidate in remote_candidates {
                        if seen.insert(candidate) {
                            candidates.push(candidate);
                        }
                    }
                }
                Err(err) => warn!(error = ?err, "tpfs.list_by_weak.remote_unavailable"),
            }
        }

        Ok(futures::stream::iter(candidates))
    }

    #[instrument(name = "Store::get_entry", skip(self))]
    pub async fn get_entry(
        &self,
        weak_fp: WeakFingerprint,
        path_set_hash: PathSetHash,
        strong_fp: StrongFingerprint,
    ) -> Result<EntryLookup> {
        if let EntryLookup::Hit(entry) = self.local.get_entry(weak_fp, path_set_hash, strong_fp).await? {
            return Ok(EntryLookup::Hit(entry));
        }

        if let Some(remote) = &self.remote {
            if let EntryLookup::Hit(entry) = remote.get_entry(weak_fp, path_set_hash, strong_fp).await? {
                // Mirror the remote hit into the local index so future
                // lookups don't pay the round trip again.
                self.local
                    .publish(
                        weak_fp,
                        path_set_hash,
                        strong_fp,
                        entry.clone(),
                        PublishMode::CreateOrReplace,
                    )
                    .await?;
                return Ok(EntryLookup::Hit(entry));
            }
        }

        Ok(EntryLookup::Absent)
    }

    /// Publishes to the local index under the per-weak-fingerprint lock,
    /// then best-effort mirrors to remote. A losing local publish returns
    /// `Conflict` without ever attempting the remote call — the caller is
    /// expected to deploy the winner's outputs from CAS instead (spec §4.2's
    /// convergence).
    #[instrument(name = "Store::publish", skip(self, entry))]
    pub async fn publish(
        &self,
        weak_fp: WeakFingerprint,
        path_set_hash: PathSetHash,
        strong_fp: StrongFingerprint,
        entry: CacheEntry,
        mode: PublishMode,
    ) -> Result<PublishResult> {
        let lock = self.lock_for(weak_fp);
        let _guard = lock.lock().await;

        let result = self
            .local
            .publish(weak_fp, path_set_hash, strong_fp, entry.clone(), mode)
            .await?;

        if let PublishResult::Published = result {
            if let Some(remote) = &self.remote {
                if let Err(err) = remote
                    .publish(weak_fp, path_set_hash, strong_fp, entry, PublishMode::CreateOrReplace)
                    .await
                {
                    warn!(error = ?err, "tpfs.publish.remote_mirror_failed");
                }
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use bxl_types::ContentHash;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_entry() -> CacheEntry {
        CacheEntry {
            strong_fingerprint: StrongFingerprint::from_bytes([3u8; 32]),
            output_hashes: vec![ContentHash::from_buffer(b"output")],
            metadata_hash: ContentHash::from_buffer(b"metadata"),
        }
    }

    #[tokio::test]
    async fn publish_then_get_entry_local_only() {
        let store = Store::new(LocalTpfs::in_memory().unwrap(), None);
        let weak = WeakFingerprint::from_bytes([1u8; 32]);
        let path_set_hash = [2u8; 32];
        let strong = StrongFingerprint::from_bytes([3u8; 32]);

        let result = store
            .publish(weak, path_set_hash, strong, sample_entry(), PublishMode::CreateNew)
            .await
            .unwrap();
        assert_eq!(result, PublishResult::Published);

        let lookup = store.get_entry(weak, path_set_hash, strong).await.unwrap();
        assert_eq!(lookup, EntryLookup::Hit(sample_entry()));
    }

    #[tokio::test]
    async fn concurrent_create_new_publishes_yield_exactly_one_winner() {
        let store = Arc::new(Store::new(LocalTpfs::in_memory().unwrap(), None));
        let weak = WeakFingerprint::from_bytes([5u8; 32]);
        let path_set_hash = [6u8; 32];
        let strong = StrongFingerprint::from_bytes([7u8; 32]);

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let store = store.clone();
            let mut entry = sample_entry();
            entry.metadata_hash = ContentHash::from_buffer([i]);
            handles.push(tokio::spawn(async move {
                store
                    .publish(weak, path_set_hash, strong, entry, PublishMode::CreateNew)
                    .await
                    .unwrap()
            }));
        }

        let mut published = 0;
        let mut conflicted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                PublishResult::Published => published += 1,
                PublishResult::Conflict(_) => conflicted += 1,
            }
        }

        assert_eq!(published, 1);
        assert_eq!(conflicted, 7);
    }

    #[tokio::test]
    async fn list_by_weak_streams_local_candidates() {
        let store = Store::new(LocalTpfs::in_memory().unwrap(), None);
        let weak = WeakFingerprint::from_bytes([1u8; 32]);

        store
            .publish(
                weak,
                [1u8; 32],
                StrongFingerprint::from_bytes([10u8; 32]),
                sample_entry(),
                PublishMode::CreateNew,
            )
            .await
            .unwrap();

        let candidates: Vec<_> = store.list_by_weak(weak).await.unwrap().collect().await;
        assert_eq!(candidates.len(), 1);
    }
}
