//! HTTP-backed remote TPFS index.
//!
//! Grounded on `clients/src/courier/v1/client.rs`'s `Client` (Arc<Url> +
//! `reqwest::Client`, one method per endpoint) and the remote publish/
//! restore API shape of `courier/src/api/v1/cache/cargo/*`, generalized from
//! unit-hash keying to the `(weak, path_set, strong)` triple.

use bxl_types::fingerprint::PathSetHash;
use bxl_types::{CacheEntry, StrongFingerprint, WeakFingerprint};
use color_eyre::Result;
use color_eyre::eyre::{Context, eyre};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use url::Url;

use crate::store::{EntryLookup, PublishMode, PublishResult, TpfsCandidate};

#[derive(Serialize, Deserialize)]
struct PublishRequest {
    entry: CacheEntry,
    create_new: bool,
}

#[derive(Serialize, Deserialize)]
struct CandidateWire {
    path_set_hash: String,
    strong_fingerprint: String,
}

pub struct RemoteTpfs {
    base: Url,
    http: reqwest::Client,
}

impl RemoteTpfs {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }

    fn triple_url(
        &self,
        weak_fp: WeakFingerprint,
        path_set_hash: PathSetHash,
        strong_fp: StrongFingerprint,
    ) -> Url {
        self.base
            .join(&format!(
                "/api/v1/tpfs/{}/{}/{}",
                weak_fp.to_hex(),
                hex::encode(path_set_hash),
                strong_fp.to_hex()
            ))
            .expect("valid tpfs triple path")
    }

    fn weak_url(&self, weak_fp: WeakFingerprint) -> Url {
        self.base
            .join(&format!("/api/v1/tpfs/{}", weak_fp.to_hex()))
            .expect("valid tpfs weak path")
    }

    #[instrument(name = "RemoteTpfs::list_by_weak", skip(self))]
    pub async fn list_by_weak(&self, weak_fp: WeakFingerprint) -> Result<Vec<TpfsCandidate>> {
        let response = self
            .http
            .get(self.weak_url(weak_fp))
            .send()
            .await
            .context("send tpfs list_by_weak request")?;

        if !response.status().is_success() {
            return Err(eyre!("tpfs list_by_weak returned {}", response.status()));
        }

        let wire: Vec<CandidateWire> = response
            .json()
            .await
            .context("decode tpfs candidate list")?;

        wire.into_iter()
            .map(|candidate| {
                let path_set_hash = decode_32(&candidate.path_set_hash)?;
                let strong_fingerprint =
                    StrongFingerprint::from_bytes(decode_32(&candidate.strong_fingerprint)?);
                Ok(TpfsCandidate {
                    path_set_hash,
                    strong_fingerprint,
                })
            })
            .collect()
    }

    #[instrument(name = "RemoteTpfs::get_entry", skip(self))]
    pub async fn get_entry(
        &self,
        weak_fp: WeakFingerprint,
        path_set_hash: PathSetHash,
        strong_fp: StrongFingerprint,
    ) -> Result<EntryLookup> {
        let response = self
            .http
            .get(self.triple_url(weak_fp, path_set_hash, strong_fp))
            .send()
            .await
            .context("send tpfs get_entry request")?;

        match response.status() {
            StatusCode::OK => {
                let entry: CacheEntry = response.json().await.context("decode cache entry")?;
                Ok(EntryLookup::Hit(entry))
            }
            StatusCode::NOT_FOUND => Ok(EntryLookup::Absent),
            status => Err(eyre!("tpfs get_entry returned {status}")),
        }
    }

    #[instrument(name = "RemoteTpfs::publish", skip(self, entry))]
    pub async fn publish(
        &self,
        weak_fp: WeakFingerprint,
        path_set_hash: PathSetHash,
        strong_fp: StrongFingerprint,
        entry: CacheEntry,
        mode: PublishMode,
    ) -> Result<PublishResult> {
        let request = PublishRequest {
            entry,
            create_new: matches!(mode, PublishMode::CreateNew),
        };

        let response = self
            .http
            .put(self.triple_url(weak_fp, path_set_hash, strong_fp))
            .json(&request)
            .send()
            .await
            .context("send tpfs publish request")?;

        match response.status() {
            StatusCode::CREATED => Ok(PublishResult::Published),
            StatusCode::CONFLICT => {
                let existing: CacheEntry = response.json().await.context("decode conflicting entry")?;
                Ok(PublishResult::Conflict(existing))
            }
            status => Err(eyre!("tpfs publish returned {status}")),
        }
    }
}

fn decode_32(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str).context("decode 32-byte hex value")?;
    if bytes.len() != 32 {
        return Err(eyre!("expected 32 bytes, got {}", bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}
