//! Thin HTTP server fronting a [`crate::local::LocalTpfs`] for the remote
//! TPFS site.
//!
//! Grounded on `courier/src/api/v1/cache/cargo/{save,restore}.rs`'s handler
//! shape (`IntoResponse` enums over status codes), with the Postgres/org-
//! auth layer dropped in favor of the SQLite-backed `LocalTpfs` — see
//! `DESIGN.md`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
};
use bxl_types::{CacheEntry, StrongFingerprint, WeakFingerprint};
use color_eyre::eyre::Report;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::local::LocalTpfs;
use crate::store::{EntryLookup, PublishMode, PublishResult};

#[derive(Clone)]
pub struct AppState {
    tpfs: Arc<LocalTpfs>,
}

pub fn router(tpfs: LocalTpfs) -> Router {
    let state = AppState {
        tpfs: Arc::new(tpfs),
    };
    Router::new()
        .route("/api/v1/tpfs/{weak}", get(list_by_weak))
        .route(
            "/api/v1/tpfs/{weak}/{path_set}/{strong}",
            get(get_entry).put(publish),
        )
        .with_state(state)
}

fn parse_weak(raw: &str) -> Result<WeakFingerprint, StatusCode> {
    let bytes = decode_32(raw).ok_or(StatusCode::BAD_REQUEST)?;
    Ok(WeakFingerprint::from_bytes(bytes))
}

fn parse_strong(raw: &str) -> Result<StrongFingerprint, StatusCode> {
    let bytes = decode_32(raw).ok_or(StatusCode::BAD_REQUEST)?;
    Ok(StrongFingerprint::from_bytes(bytes))
}

fn parse_path_set(raw: &str) -> Result<[u8; 32], StatusCode> {
    decode_32(raw).ok_or(StatusCode::BAD_REQUEST)
}

fn decode_32(raw: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(raw).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Some(out)
}

#[derive(Serialize)]
struct CandidateWire {
    path_set_hash: String,
    strong_fingerprint: String,
}

#[derive(Deserialize)]
struct PublishRequest {
    entry: CacheEntry,
    create_new: bool,
}

#[tracing::instrument(skip(state))]
async fn list_by_weak(State(state): State<AppState>, Path(weak): Path<String>) -> TpfsResponse {
    let Ok(weak) = parse_weak(&weak) else {
        return TpfsResponse::BadRequest;
    };
    match state.tpfs.list_by_weak(weak).await {
        Ok(candidates) => {
            let wire = candidates
                .into_iter()
                .map(|c| CandidateWire {
                    path_set_hash: hex::encode(c.path_set_hash),
                    strong_fingerprint: c.strong_fingerprint.to_hex(),
                })
                .collect::<Vec<_>>();
            TpfsResponse::Candidates(wire)
        }
        Err(err) => {
            error!(error = ?err, "tpfs.list_by_weak.error");
            TpfsResponse::Error(err)
        }
    }
}

#[tracing::instrument(skip(state))]
async fn get_entry(
    State(state): State<AppState>,
    Path((weak, path_set, strong)): Path<(String, String, String)>,
) -> TpfsResponse {
    let (Ok(weak), Ok(path_set), Ok(strong)) =
        (parse_weak(&weak), parse_path_set(&path_set), parse_strong(&strong))
    else {
        return TpfsResponse::BadRequest;
    };

    match state.tpfs.get_entry(weak, path_set, strong).await {
        Ok(EntryLookup::Hit(entry)) => {
            info!("tpfs.get_entry.hit");
            TpfsResponse::Entry(entry)
        }
        Ok(EntryLookup::Absent) => {
            info!("tpfs.get_entry.absent");
            TpfsResponse::NotFound
        }
        Err(err) => {
            error!(error = ?err, "tpfs.get_entry.error");
            TpfsResponse::Error(err)
        }
    }
}

#[tracing::instrument(skip(state, body))]
async fn publish(
    State(state): State<AppState>,
    Path((weak, path_set, strong)): Path<(String, String, String)>,
    Json(body): Json<PublishRequest>,
) -> TpfsResponse {
    let (Ok(weak), Ok(path_set), Ok(strong)) =
        (parse_weak(&weak), parse_path_set(&path_set), parse_strong(&strong))
    else {
        return TpfsResponse::BadRequest;
    };

    let mode = if body.create_new {
        PublishMode::CreateNew
    } else {
        PublishMode::CreateOrReplace
    };

    match state.tpfs.publish(weak, path_set, strong, body.entry, mode).await {
        Ok(PublishResult::Published) => {
            info!("tpfs.publish.created");
            TpfsResponse::Created
        }
        Ok(PublishResult::Conflict(existing)) => {
            info!("tpfs.publish.conflict");
            TpfsResponse::Conflict(existing)
        }
        Err(err) => {
            error!(error = ?err, "tpfs.publish.error");
            TpfsResponse::Error(err)
        }
    }
}

enum TpfsResponse {
    Created,
    Entry(CacheEntry),
    Conflict(CacheEntry),
    Candidates(Vec<CandidateWire>),
    NotFound,
    BadRequest,
    Error(Report),
}

impl IntoResponse for TpfsResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            TpfsResponse::Created => StatusCode::CREATED.into_response(),
            TpfsResponse::Entry(entry) => (StatusCode::OK, Json(entry)).into_response(),
            TpfsResponse::Conflict(existing) => {
                (StatusCode::CONFLICT, Json(existing)).into_response()
            }
            TpfsResponse::Candidates(candidates) => {
                (StatusCode::OK, Json(candidates)).into_response()
            }
            TpfsResponse::NotFound => StatusCode::NOT_FOUND.into_response(),
            TpfsResponse::BadRequest => StatusCode::BAD_REQUEST.into_response(),
            TpfsResponse::Error(error) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{error:?}")).into_response()
            }
        }
    }
}
