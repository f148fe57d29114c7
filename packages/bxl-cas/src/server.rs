//! Thin HTTP server fronting a [`crate::local::LocalCasSite`] for the remote
//! CAS site.
//!
//! Grounded on `courier/src/api/v1/cas/{write,read,check}.rs`'s handler
//! shape (`IntoResponse` enums distinguishing success/not-found/error), with
//! the auth/org-scoping layer dropped — see `DESIGN.md` for why this
//! distillation keeps the remote cache service same-trust-boundary rather
//! than multi-tenant.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
};
use bxl_types::ContentHash;
use color_eyre::eyre::Report;
use tracing::{error, info};

use crate::local::LocalCasSite;

#[derive(Clone)]
pub struct AppState {
    cas: Arc<LocalCasSite>,
}

pub fn router(cas: LocalCasSite) -> Router {
    let state = AppState { cas: Arc::new(cas) };
    Router::new()
        .route("/api/v1/cas/{hash}", put(write).get(read).head(check))
        .with_state(state)
}

fn parse_hash(raw: &str) -> Result<ContentHash, StatusCode> {
    ContentHash::from_hex(raw).map_err(|_| StatusCode::BAD_REQUEST)
}

#[tracing::instrument(skip(state, body))]
async fn write(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    body: Body,
) -> CasResponse {
    let Ok(hash) = parse_hash(&hash) else {
        return CasResponse::BadRequest;
    };

    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(error = ?err, "cas.write.body_error");
            return CasResponse::Error(color_eyre::eyre::eyre!(err));
        }
    };

    match state.cas.write_verified(&hash, &bytes).await {
        Ok(_) => {
            info!(%hash, "cas.write.success");
            CasResponse::Created
        }
        Err(err) => {
            error!(error = ?err, "cas.write.error");
            CasResponse::Error(err)
        }
    }
}

#[tracing::instrument(skip(state))]
async fn read(State(state): State<AppState>, Path(hash): Path<String>) -> CasResponse {
    let Ok(hash) = parse_hash(&hash) else {
        return CasResponse::BadRequest;
    };
    match state.cas.read_buffered(&hash).await {
        Ok(Some(content)) => CasResponse::Found(content),
        Ok(None) => CasResponse::NotFound,
        Err(err) => {
            error!(error = ?err, "cas.read.error");
            CasResponse::Error(err)
        }
    }
}

#[tracing::instrument(skip(state))]
async fn check(State(state): State<AppState>, Path(hash): Path<String>) -> CasResponse {
    let Ok(hash) = parse_hash(&hash) else {
        return CasResponse::BadRequest;
    };
    match state.cas.exists(&hash).await {
        Ok(true) => CasResponse::Found(Vec::new()),
        Ok(false) => CasResponse::NotFound,
        Err(err) => {
            error!(error = ?err, "cas.check.error");
            CasResponse::Error(err)
        }
    }
}

enum CasResponse {
    Created,
    Found(Vec<u8>),
    NotFound,
    BadRequest,
    Error(Report),
}

impl IntoResponse for CasResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            CasResponse::Created => StatusCode::CREATED.into_response(),
            CasResponse::Found(bytes) => (StatusCode::OK, bytes).into_response(),
            CasResponse::NotFound => StatusCode::NOT_FOUND.into_response(),
            CasResponse::BadRequest => StatusCode::BAD_REQUEST.into_response(),
            CasResponse::Error(error) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{error:?}")).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Method;
    use axum_test::TestServer;
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let server = TestServer::new(router(LocalCasSite::new(temp.path()))).unwrap();

        let content = b"server round trip";
        let hash = ContentHash::from_buffer(content);
        let url = format!("/api/v1/cas/{}", hash.to_hex());

        let write_response = server.put(&url).bytes(content.to_vec().into()).await;
        write_response.assert_status(StatusCode::CREATED);

        let read_response = server.get(&url).await;
        read_response.assert_status_ok();
        assert_eq!(read_response.as_bytes().to_vec(), content);

        let check_response = server.method(Method::HEAD, &url).await;
        check_response.assert_status_ok();
    }

    #[tokio::test]
    async fn check_missing_is_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let server = TestServer::new(router(LocalCasSite::new(temp.path()))).unwrap();

        let hash = ContentHash::from_buffer(b"missing");
        let url = format!("/api/v1/cas/{}", hash.to_hex());
        let response = server.method(Method::HEAD, &url).await;
        response.assert_status(StatusCode::NOT_FOUND);
    }
}
