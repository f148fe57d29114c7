//! Materialization fan-out (§4.6/4.7 ambient additions): a `flume`-channel
//! plus `JoinSet` worker pool bounded by `num_cpus::get()`, mirroring the
//! teacher's `hurry/src/cargo/cache/restore.rs` `restore_units`/
//! `restore_worker` pattern, generalized from cargo units to arbitrary
//! `(ContentHash, target path, RealizationMode)` materialization requests.

use std::path::PathBuf;
use std::sync::Arc;

use bxl_cas::Store as CasStore;
use bxl_types::{BuildError, ContentHash, RealizationMode};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, instrument};

/// One file to materialize onto disk from the CAS.
#[derive(Clone, Debug)]
pub struct MaterializeRequest {
    pub hash: ContentHash,
    pub target: PathBuf,
    pub mode: RealizationMode,
}

/// Materializes every request using a bounded worker pool, returning the
/// first error encountered (other requests already in flight still run to
/// completion — the teacher's `restore_units` has the same "collect all
/// worker results, first error wins" discipline).
#[instrument(skip(cas, requests))]
pub async fn materialize_all(cas: Arc<CasStore>, requests: Vec<MaterializeRequest>) -> Result<(), BuildError> {
    if requests.is_empty() {
        return Ok(());
    }

    let worker_count = num_cpus::get().min(requests.len());
    let (tx, rx) = flume::unbounded::<MaterializeRequest>();
    let mut workers = JoinSet::new();

    let progress = ProgressBar::new(requests.len() as u64);
    progress.set_style(ProgressStyle::default_bar().template("materializing [{bar:30.cyan/blue}] {pos}/{len}").expect("invalid progress bar template").progress_chars("=> "));

    for worker_id in 0..worker_count {
        let rx = rx.clone();
        let cas = cas.clone();
        let progress = progress.clone();
        let span = tracing::info_span!("materialize_worker", worker_id);
        workers.spawn(materialize_worker(rx, cas, progress).instrument(span));
    }

    for request in requests {
        // Channel has no receivers only if every worker already panicked;
        // an unbounded send here can't actually fail in that window before
        // we've joined them, so a dropped result is fine to ignore.
        let _ = tx.send_async(request).await;
    }
    drop(tx);

    let mut first_error = None;
    while let Some(result) = workers.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(?err, "materialize worker reported an error");
                first_error.get_or_insert(err);
            }
            Err(join_err) => {
                first_error.get_or_insert(BuildError::InternalError {
                    message: format!("materialize worker panicked: {join_err}"),
                });
            }
        }
    }
    progress.finish_and_clear();

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn materialize_worker(rx: flume::Receiver<MaterializeRequest>, cas: Arc<CasStore>, progress: ProgressBar) -> Result<(), BuildError> {
    while let Ok(request) = rx.recv_async().await {
        cas.materialize(&request.target, &request.hash, request.mode).await?;
        progress.inc(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bxl_cas::local::LocalCasSite;
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn materializes_every_request_concurrently() {
        let temp = tempfile::tempdir().unwrap();
        let cas = Arc::new(CasStore::new(LocalCasSite::new(temp.path()), None));
        let hash_a = cas.store(b"alpha", None).await.unwrap();
        let hash_b = cas.store(b"beta", None).await.unwrap();

        let requests = vec![
            MaterializeRequest {
                hash: hash_a,
                target: temp.path().join("a.txt"),
                mode: RealizationMode::Copy,
            },
            MaterializeRequest {
                hash: hash_b,
                target: temp.path().join("b.txt"),
                mode: RealizationMode::Copy,
            },
        ];

        materialize_all(cas, requests).await.unwrap();
        assert_eq!(tokio::fs::read(temp.path().join("a.txt")).await.unwrap(), b"alpha");
        assert_eq!(tokio::fs::read(temp.path().join("b.txt")).await.unwrap(), b"beta");
    }

    #[tokio::test]
    async fn empty_request_list_is_a_no_op() {
        let temp = tempfile::tempdir().unwrap();
        let cas = Arc::new(CasStore::new(LocalCasSite::new(temp.path()), None));
        materialize_all(cas, vec![]).await.unwrap();
    }
}
