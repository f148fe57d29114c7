//! SQLite-backed local TPFS index.
//!
//! Grounded on `hurry/src/cache/local/metadata.rs`'s `LocalMetadata`: same
//! `rusqlite` + idempotent `init_schema` + `INSERT OR REPLACE` shape, keyed
//! here by the three-part `(weak_fp, path_set_hash, strong_fp)` tuple instead
//! of a flat unit hash.

use std::path::Path;

use bxl_types::fingerprint::PathSetHash;
use bxl_types::{CacheEntry, StrongFingerprint, WeakFingerprint};
use color_eyre::{Result, eyre::Context};
use derive_more::Debug;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;
use tracing::instrument;

use crate::store::{EntryLookup, PublishMode, PublishResult, TpfsCandidate};

/// Local, single-process TPFS index.
///
/// Wrapped in a `tokio::sync::Mutex` rather than called synchronously like
/// the teacher's `LocalMetadata`: callers here are async (`bxl-engine`'s
/// executor tasks), so the connection needs to be safely shared across them.
#[derive(Debug)]
pub struct LocalTpfs {
    #[debug("<connection>")]
    conn: Mutex<Connection>,
}

impl LocalTpfs {
    #[instrument(name = "LocalTpfs::open", skip(path))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            #[allow(clippy::disallowed_methods)]
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create tpfs directory {parent:?}"))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("open tpfs database at {path:?}"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema_blocking()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory tpfs database")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema_blocking()?;
        Ok(db)
    }

    fn init_schema_blocking(&self) -> Result<()> {
        let conn = self
            .conn
            .try_lock()
            .expect("no concurrent access during construction");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tpfs_entries (
                weak_fp TEXT NOT NULL,
                path_set_hash TEXT NOT NULL,
                strong_fp TEXT NOT NULL,
                entry_json TEXT NOT NULL,
                PRIMARY KEY (weak_fp, path_set_hash, strong_fp)
            );

            CREATE INDEX IF NOT EXISTS idx_tpfs_entries_weak
            ON tpfs_entries(weak_fp);
            "#,
        )
        .context("initialize tpfs schema")?;
        Ok(())
    }

    #[instrument(name = "LocalTpfs::list_by_weak", skip(self))]
    pub async fn list_by_weak(&self, weak_fp: WeakFingerprint) -> Result<Vec<TpfsCandidate>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT path_set_hash, strong_fp FROM tpfs_entries WHERE weak_fp = ?1")
            .context("prepare list_by_weak query")?;
        let rows = stmt
            .query_map(params![weak_fp.to_hex()], |row| {
                let path_set_hash: String = row.get(0)?;
                let strong_fp: String = row.get(1)?;
                Ok((path_set_hash, strong_fp))
            })
            .context("execute list_by_weak query")?;

        let mut candidates = Vec::new();
        for row in rows {
            let (path_set_hex, strong_hex) = row.context("read tpfs row")?;
            candidates.push(TpfsCandidate {
                path_set_hash: decode_path_set_hash(&path_set_hex)?,
                strong_fingerprint: decode_strong_fp(&strong_hex)?,
            });
        }
        Ok(candidates)
    }

    /// Looks up a specific `(weak, path_set, strong)` triple. A triple that
    /// was never published and one that was published then evicted are
    /// indistinguishable from a caller's perspective — both mean "no usable
    /// content for this candidate, try the next one" — so both collapse to
    /// [`EntryLookup::Absent`] rather than a third state (documented in
    /// `DESIGN.md`).
    #[instrument(name = "LocalTpfs::get_entry", skip(self))]
    pub async fn get_entry(
        &self,
        weak_fp: WeakFingerprint,
        path_set_hash: PathSetHash,
        strong_fp: StrongFingerprint,
    ) -> Result<EntryLookup> {
        let conn = self.conn.lock().await;
        let entry_json: Option<String> = conn
            .query_row(
                "SELECT entry_json FROM tpfs_entries WHERE weak_fp = ?1 AND path_set_hash = ?2 AND strong_fp = ?3",
                params![weak_fp.to_hex(), hex::encode(path_set_hash), strong_fp.to_hex()],
                |row| row.get(0),
            )
            .optional()
            .context("query tpfs entry")?;

        match entry_json {
            None => Ok(EntryLookup::Absent),
            Some(json) => {
                let entry: CacheEntry =
                    serde_json::from_str(&json).context("deserialize cache entry")?;
                Ok(EntryLookup::Hit(entry))
            }
        }
    }

    #[instrument(name = "LocalTpfs::publish", skip(self, entry))]
    pub async fn publish(
        &self,
        weak_fp: WeakFingerprint,
        path_set_hash: PathSetHash,
        strong_fp: StrongFingerprint,
        entry: CacheEntry,
        mode: PublishMode,
    ) -> Result<PublishResult> {
        let conn = self.conn.lock().await;

        let existing: Option<String> = conn
            .query_row(
                "SELECT entry_json FROM tpfs_entries WHERE weak_fp = ?1 AND path_set_hash = ?2 AND strong_fp = ?3",
                params![weak_fp.to_hex(), hex::encode(path_set_hash), strong_fp.to_hex()],
                |row| row.get(0),
            )
            .optional()
            .context("check existing tpfs entry")?;

        if let (PublishMode::CreateNew, Some(existing_json)) = (mode, &existing) {
            let existing_entry: CacheEntry =
                serde_json::from_str(existing_json).context("deserialize existing entry")?;
            return Ok(PublishResult::Conflict(existing_entry));
        }

        let data = serde_json::to_string(&entry).context("serialize cache entry")?;
        conn.execute(
            "INSERT OR REPLACE INTO tpfs_entries (weak_fp, path_set_hash, strong_fp, entry_json) VALUES (?1, ?2, ?3, ?4)",
            params![weak_fp.to_hex(), hex::encode(path_set_hash), strong_fp.to_hex(), data],
        )
        .context("insert tpfs entry")?;

        Ok(PublishResult::Published)
    }

    #[cfg(test)]
    pub async fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM tpfs_entries", [], |row| row.get(0))
            .context("count tpfs entries")?;
        Ok(count as usize)
    }
}

fn decode_path_set_hash(hex_str: &str) -> Result<PathSetHash> {
    let bytes = hex::decode(hex_str).context("decode path set hash")?;
    if bytes.len() != 32 {
        color_eyre::eyre::bail!("expected 32-byte path set hash, got {}", bytes.len());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn decode_strong_fp(hex_str: &str) -> Result<StrongFingerprint> {
    let bytes = hex::decode(hex_str).context("decode strong fingerprint")?;
    if bytes.len() != 32 {
        color_eyre::eyre::bail!("expected 32-byte strong fingerprint, got {}", bytes.len());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(StrongFingerprint::from_bytes(out))
}

#[cfg(test)]
mod tests {
    use bxl_types::ContentHash;
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
    async fn publish_then_get_entry_round_trips() {
        let db = LocalTpfs::in_memory().unwrap();
        let weak = WeakFingerprint::from_bytes([1u8; 32]);
        let path_set_hash = [2u8; 32];
        let strong = StrongFingerprint::from_bytes([3u8; 32]);
        let entry = sample_entry();

        let result = db
            .publish(weak, path_set_hash, strong, entry.clone(), PublishMode::CreateNew)
            .await
            .unwrap();
        assert_eq!(result, PublishResult::Published);

        let lookup = db.get_entry(weak, path_set_hash, strong).await.unwrap();
        assert_eq!(lookup, EntryLookup::Hit(entry));
    }

    #[tokio::test]
    async fn get_entry_on_unpublished_triple_is_absent() {
        let db = LocalTpfs::in_memory().unwrap();
        let lookup = db
            .get_entry(
                WeakFingerprint::from_bytes([9u8; 32]),
                [9u8; 32],
                StrongFingerprint::from_bytes([9u8; 32]),
            )
            .await
            .unwrap();
        assert_eq!(lookup, EntryLookup::Absent);
    }

    #[tokio::test]
    async fn create_new_conflicts_with_existing_entry() {
        let db = LocalTpfs::in_memory().unwrap();
        let weak = WeakFingerprint::from_bytes([4u8; 32]);
        let path_set_hash = [5u8; 32];
        let strong = StrongFingerprint::from_bytes([6u8; 32]);
        let first = sample_entry();

        db.publish(weak, path_set_hash, strong, first.clone(), PublishMode::CreateNew)
            .await
            .unwrap();

        let mut second = sample_entry();
        second.metadata_hash = ContentHash::from_buffer(b"other metadata");
        let result = db
            .publish(weak, path_set_hash, strong, second, PublishMode::CreateNew)
            .await
            .unwrap();
        assert_eq!(result, PublishResult::Conflict(first));
    }

    #[tokio::test]
    async fn create_or_replace_overwrites_without_conflict() {
        let db = LocalTpfs::in_memory().unwrap();
        let weak = WeakFingerprint::from_bytes([7u8; 32]);
        let path_set_hash = [8u8; 32];
        let strong = StrongFingerprint::from_bytes([9u8; 32]);

        db.publish(weak, path_set_hash, strong, sample_entry(), PublishMode::CreateNew)
            .await
            .unwrap();

        let mut replacement = sample_entry();
        replacement.metadata_hash = ContentHash::from_buffer(b"replacement");
        let result = db
            .publish(
                weak,
                path_set_hash,
                strong,
                replacement.clone(),
                PublishMode::CreateOrReplace,
            )
            .await
            .unwrap();
        assert_eq!(result, PublishResult::Published);

        let lookup = db.get_entry(weak, path_set_hash, strong).await.unwrap();
        assert_eq!(lookup, EntryLookup::Hit(replacement));
    }

    #[tokio::test]
    async fn list_by_weak_returns_all_candidates_for_the_weak_fingerprint() {
        let db = LocalTpfs::in_memory().unwrap();
        let weak = WeakFingerprint::from_bytes([1u8; 32]);

        db.publish(
            weak,
            [1u8; 32],
            StrongFingerprint::from_bytes([10u8; 32]),
            sample_entry(),
            PublishMode::CreateNew,
        )
        .await
        .unwrap();
        db.publish(
            weak,
            [2u8; 32],
            StrongFingerprint::from_bytes([20u8; 32]),
            sample_entry(),
            PublishMode::CreateNew,
        )
        .await
        .unwrap();
        db.publish(
            WeakFingerprint::from_bytes([99u8; 32]),
            [3u8; 32],
            StrongFingerprint::from_bytes([30u8; 32]),
            sample_entry(),
            PublishMode::CreateNew,
        )
        .await
        .unwrap();

        let candidates = db.list_by_weak(weak).await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(db.count().await.unwrap(), 3);
    }
}
