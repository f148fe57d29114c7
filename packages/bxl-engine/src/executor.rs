//! The Pip Executor state machine (§4.6): an explicit enum plus a driver
//! function, matching the teacher's preference for plain control flow over
//! a trait-object state pattern (see `cargo/cache.rs`'s flat match-driven
//! fingerprint comparisons rather than a `State` trait hierarchy).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bxl_fingerprint::{Fingerprinter, WeakFingerprintInputs, canonicalize, path_set_hash};
use bxl_sandbox::driver::{ProcessSpec, SandboxDriver};
use bxl_sandbox::manifest::{FileAccessManifest, PolicyOutcome};
use bxl_tpfs::{EntryLookup, PublishMode, PublishResult};
use bxl_types::cache::CacheEntryMetadata;
use bxl_types::pathset::{AccessType, ObservedValue, PathSetEntry};
use bxl_types::{BuildError, CacheEntry, ContentHash, ObservedInput, Pip, PipId, PipKind, ProcessOptions, RealizationMode, WeakFingerprint};
use futures::StreamExt;
use tracing::{debug, instrument, warn};

use crate::context::BuildContext;
use crate::file_content_manager::{FileContentManager, OutputOrigin};
use crate::worker_pool::{self, MaterializeRequest};

/// States per pip (§4.6).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PipState {
    Waiting,
    MaterializingInputs,
    CacheCheck,
    Executing,
    DeployingFromCache,
    ValidatingOutputs,
    Publishing,
    Done,
}

/// Terminal outcomes (§4.6).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ExecutionOutcome {
    Succeeded,
    UpToDate,
    DeployedFromCache,
    Failed,
}

/// Counters the cache-lookup loop accumulates (§4.6 step 2).
#[derive(Clone, Copy, Default, Debug)]
pub struct CacheLookupStats {
    pub visited_entries: u32,
    pub visited_absent_entries: u32,
}

pub struct PipExecutionResult {
    pub pip_id: PipId,
    pub outcome: ExecutionOutcome,
    pub cacheable: bool,
    pub cache_stats: CacheLookupStats,
    pub error: Option<BuildError>,
}

/// Re-observe a single path-set entry's current filesystem value.
///
/// Returns `None` when the current filesystem shape is inconsistent with
/// the entry's access type (e.g. a path recorded as `FileContentRead` is
/// now a directory) — the cache-lookup loop treats that as a candidate
/// mismatch rather than an error (§4.6 step 2: "on mismatch, continue").
async fn reobserve_entry(entry: &PathSetEntry) -> Option<ObservedValue> {
    let metadata = tokio::fs::symlink_metadata(&entry.path).await.ok();
    match entry.access_type {
        AccessType::AbsentPathProbe => match metadata {
            None => Some(ObservedValue::Absent),
            Some(_) => None,
        },
        AccessType::ExistenceProbe => Some(ObservedValue::Existence(metadata.is_some())),
        AccessType::DirectoryEnumeration => {
            let meta = metadata?;
            if !meta.is_dir() {
                return None;
            }
            let mut names = Vec::new();
            let mut dir = tokio::fs::read_dir(&entry.path).await.ok()?;
            while let Ok(Some(child)) = dir.next_entry().await {
                names.push(child.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            Some(ObservedValue::Enumeration(ContentHash::from_fields(names)))
        }
        AccessType::FileContentRead => {
            let meta = metadata?;
            if !meta.is_file() {
                return None;
            }
            let content = tokio::fs::read(&entry.path).await.ok()?;
            Some(ObservedValue::Content(ContentHash::from_buffer(content)))
        }
    }
}

async fn reobserve_path_set(entries: &[PathSetEntry]) -> Option<Vec<ObservedInput>> {
    let mut observed = Vec::with_capacity(entries.len());
    for entry in entries {
        let value = reobserve_entry(entry).await?;
        observed.push(ObservedInput { entry: entry.clone(), value });
    }
    Some(observed)
}

/// §4.6 step 2: enumerate TPFS candidates lazily, replaying each against
/// the live filesystem until one matches and is still present, or the
/// candidates are exhausted.
#[instrument(skip(ctx, weak), fields(weak = %weak))]
async fn lookup_cache(ctx: &BuildContext, weak: WeakFingerprint) -> Result<(Option<CacheEntry>, CacheLookupStats), BuildError> {
    let mut stats = CacheLookupStats::default();
    let mut candidates = ctx.tpfs.list_by_weak(weak).await.map_err(|e| BuildError::CacheFailure { message: format!("{e:#}") })?;

    while let Some(candidate) = candidates.next().await {
        stats.visited_entries += 1;

        let hash = match ContentHash::from_bytes(candidate.path_set_hash) {
            Ok(h) => h,
            Err(_) => continue,
        };
        ctx.cas.load_available(std::slice::from_ref(&hash)).await?;
        let path_set: Vec<PathSetEntry> = match ctx.cas.open_stream(&hash).await {
            bxl_cas::store::OpenStream::Found(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(_) => continue,
            },
            _ => continue,
        };

        let Some(observed) = reobserve_path_set(&path_set).await else {
            continue;
        };

        let actual_strong = Fingerprinter::strong_fingerprint(weak, candidate.path_set_hash, &observed);
        if actual_strong != candidate.strong_fingerprint {
            continue;
        }

        match ctx
            .tpfs
            .get_entry(weak, candidate.path_set_hash, actual_strong)
            .await
            .map_err(|e| BuildError::CacheFailure { message: format!("{e:#}") })?
        {
            EntryLookup::Hit(entry) => return Ok((Some(entry), stats)),
            EntryLookup::Absent => {
                stats.visited_absent_entries += 1;
                continue;
            }
        }
    }

    Ok((None, stats))
}

fn expected_output_hashes(entry: &CacheEntry, pip: &Pip) -> Vec<(PathBuf, ContentHash)> {
    pip.declared_outputs
        .iter()
        .zip(entry.output_hashes.iter())
        .map(|(declared, hash)| (declared.artifact.path.clone(), *hash))
        .collect()
}

/// Whether every expected output is still actually present (or actually
/// absent, for `AbsentFileHash` entries) on disk right now. The file-
/// content-table is a cache of *known recent* hashes (§4.6); it can go
/// stale when something outside this build deletes or replaces an output
/// between runs, so `UpToDate` additionally requires this live check
/// (§8 scenario 2: a deleted destination must force `DeployedFromCache`,
/// never a false `UpToDate`).
async fn outputs_still_present(expected: &[(PathBuf, ContentHash)]) -> bool {
    for (path, hash) in expected {
        let exists = tokio::fs::try_exists(path).await.unwrap_or(false);
        if hash.is_absent() {
            if exists {
                return false;
            }
        } else if !exists {
            return false;
        }
    }
    true
}

/// Cache-hit replay path (§4.6): `UpToDate` if every declared output is
/// already on disk at its recorded hash, `DeployedFromCache` otherwise.
async fn replay_cache_hit(ctx: &BuildContext, fcm: &FileContentManager, pip: &Pip, entry: CacheEntry) -> Result<ExecutionOutcome, BuildError> {
    let expected = expected_output_hashes(&entry, pip);

    if fcm.all_up_to_date(&expected) && outputs_still_present(&expected).await {
        fcm.record_origin(pip.id, OutputOrigin::UpToDate);
        return Ok(ExecutionOutcome::UpToDate);
    }

    let requests: Vec<MaterializeRequest> = expected
        .iter()
        .filter(|(_, hash)| !hash.is_absent())
        .map(|(path, hash)| MaterializeRequest {
            hash: *hash,
            target: path.clone(),
            mode: RealizationMode::HardLinkOrCopy,
        })
        .collect();
    worker_pool::materialize_all(ctx.cas.clone(), requests).await?;

    for (path, hash) in &expected {
        fcm.record(path.clone(), *hash, RealizationMode::HardLinkOrCopy, pip.id);
    }
    fcm.record_origin(pip.id, OutputOrigin::DeployedFromCache);
    Ok(ExecutionOutcome::DeployedFromCache)
}

/// §4.6 step 3: materialize declared inputs that are themselves another
/// pip's tracked output; source files are assumed present on disk already.
async fn materialize_inputs(ctx: &BuildContext, fcm: &FileContentManager, pip: &Pip) -> Result<(), BuildError> {
    let requests: Vec<MaterializeRequest> = pip
        .declared_file_inputs
        .iter()
        .filter_map(|input| {
            let hash = fcm.last_known_hash(&input.path)?;
            let mode = fcm.last_realization_mode(&input.path).unwrap_or(RealizationMode::Copy);
            Some(MaterializeRequest {
                hash,
                target: input.path.clone(),
                mode,
            })
        })
        .collect();
    worker_pool::materialize_all(ctx.cas.clone(), requests).await
}

struct SandboxExecutionResult {
    exit_code: Option<i32>,
    path_set_hash: [u8; 32],
    observed: Vec<ObservedInput>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    cacheable: bool,
}

/// Run one sandboxed attempt and fold its event stream into a canonical
/// path set, observed inputs, and a cacheability verdict (§4.6 step 3's
/// allowlist evaluation).
async fn run_one_attempt(ctx: &BuildContext, pip: &Pip, manifest: &FileAccessManifest, driver: &impl SandboxDriver, fifo_dir: &Path) -> Result<SandboxExecutionResult, BuildError> {
    let process = pip.as_process().ok_or_else(|| BuildError::InvalidInput {
        message: "execute_pip called on a non-process pip".into(),
    })?;

    let spec = ProcessSpec {
        executable: process.executable.clone(),
        arguments: process.arguments.clone(),
        environment: process.environment.clone(),
        working_dir: process.working_dir.clone(),
        timeout: process.timeout,
        is_statically_linked: false,
    };

    let run = driver
        .run(&spec, manifest, fifo_dir, pip.id.0)
        .await
        .map_err(|e| BuildError::InternalError { message: format!("{e:#}") })?;

    if run.timed_out {
        return Err(BuildError::InternalError {
            message: "sandboxed process timed out".into(),
        });
    }

    let mut cacheable = true;
    let mut fatal_violation = false;
    let mut raw_entries = Vec::new();

    for event in &run.events {
        match manifest.evaluate(event) {
            PolicyOutcome::Untracked => {}
            PolicyOutcome::Allowed | PolicyOutcome::AllowedWithWarning => {
                if let Some(access_type) = bxl_sandbox::classify::access_type_for(event.kind) {
                    raw_entries.push(PathSetEntry {
                        path: event.source_path.clone(),
                        access_type,
                    });
                }
            }
            PolicyOutcome::ViolationCacheable => {
                if let Some(access_type) = bxl_sandbox::classify::access_type_for(event.kind) {
                    raw_entries.push(PathSetEntry {
                        path: event.source_path.clone(),
                        access_type,
                    });
                }
            }
            PolicyOutcome::ViolationDoNotCache => {
                cacheable = false;
            }
            PolicyOutcome::Denied => {
                warn!(path = %event.source_path.display(), "monitoring violation");
                fatal_violation = true;
            }
        }
    }

    if fatal_violation && ctx.flags.monitoring_violations_fatal {
        return Err(BuildError::MonitoringViolation {
            path: "see sandbox event log".into(),
            fatal: true,
        });
    }
    if fatal_violation && ctx.flags.unexpected_accesses_are_errors {
        return Err(BuildError::MonitoringViolation {
            path: "see sandbox event log".into(),
            fatal: false,
        });
    }
    if fatal_violation {
        cacheable = false;
    }

    let canonical = canonicalize(raw_entries, Some(&ctx.mounts));
    let Some(observed) = reobserve_path_set(&canonical).await else {
        return Err(BuildError::InternalError {
            message: "path set entry changed shape between observation and fingerprinting".into(),
        });
    };
    let hash = path_set_hash(&canonical);

    if let Some(pattern) = &process.error_regex {
        let regex = lazy_regex::Regex::new(pattern).map_err(|e| BuildError::InvalidInput { message: e.to_string() })?;
        let combined = [run.stdout.as_slice(), run.stderr.as_slice()].concat();
        if regex.is_match(&String::from_utf8_lossy(&combined)) {
            return Err(BuildError::InvalidInput {
                message: "error regex matched process output".into(),
            });
        }
    }

    Ok(SandboxExecutionResult {
        exit_code: run.exit_code,
        path_set_hash: hash,
        observed,
        stdout: run.stdout,
        stderr: run.stderr,
        cacheable,
    })
}

/// §4.6 step 3's retry loop: `retry_exit_codes` get a bounded number of
/// fresh-sandbox reattempts, with no observations shared across attempts.
async fn execute_with_retries(ctx: &BuildContext, pip: &Pip, manifest: &FileAccessManifest, driver: &impl SandboxDriver, fifo_dir: &Path) -> Result<SandboxExecutionResult, BuildError> {
    let process = pip.as_process().ok_or_else(|| BuildError::InvalidInput {
        message: "execute_pip called on a non-process pip".into(),
    })?;

    let mut attempt = 0;
    loop {
        let result = run_one_attempt(ctx, pip, manifest, driver, fifo_dir).await?;
        let should_retry = result.exit_code.is_some_and(|code| process.retry_exit_codes.contains(&code)) && attempt < ctx.flags.max_retries;
        if !should_retry {
            return Ok(result);
        }
        attempt += 1;
        debug!(pip_id = ?pip.id, attempt, "retrying pip after a retryable exit code");
    }
}

/// Executes a `CopyFile` or `WriteFile` pip directly, with no sandbox
/// involved: these kinds have no executable to launch, so the §4.6 step 3
/// "execute" contract degenerates to the plain filesystem operation the kind
/// names. The resulting path set is built from `declared_file_inputs`
/// (§8 scenario 2's `CopyFile` source is expected to be declared there)
/// rather than from observed sandbox accesses, since there's no event stream
/// to replay.
async fn execute_direct_action(ctx: &BuildContext, pip: &Pip) -> Result<SandboxExecutionResult, BuildError> {
    async fn ensure_parent_dir(path: &Path) -> Result<(), BuildError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| BuildError::InternalError {
                message: format!("create parent directory for {}: {e}", path.display()),
            })?;
        }
        Ok(())
    }

    match &pip.kind {
        PipKind::WriteFile { destination, contents } => {
            ensure_parent_dir(&destination.path).await?;
            tokio::fs::write(&destination.path, contents).await.map_err(|e| BuildError::InternalError {
                message: format!("write {}: {e}", destination.path.display()),
            })?;
        }
        PipKind::CopyFile { source, destination } => {
            ensure_parent_dir(&destination.path).await?;
            tokio::fs::copy(&source.path, &destination.path).await.map_err(|e| BuildError::InternalError {
                message: format!("copy {} to {}: {e}", source.path.display(), destination.path.display()),
            })?;
        }
        other => {
            return Err(BuildError::InvalidInput {
                message: format!("pip kind {other:?} has no executor implementation"),
            });
        }
    }

    let raw_entries: Vec<PathSetEntry> = pip
        .declared_file_inputs
        .iter()
        .map(|input| PathSetEntry {
            path: input.path.clone(),
            access_type: AccessType::FileContentRead,
        })
        .collect();
    let canonical = canonicalize(raw_entries, Some(&ctx.mounts));
    let observed = reobserve_path_set(&canonical).await.ok_or_else(|| BuildError::InternalError {
        message: "path set entry changed shape between observation and fingerprinting".into(),
    })?;
    let hash = path_set_hash(&canonical);

    Ok(SandboxExecutionResult {
        exit_code: Some(0),
        path_set_hash: hash,
        observed,
        stdout: Vec::new(),
        stderr: Vec::new(),
        cacheable: true,
    })
}

/// §4.6 step 4: every required output must exist; optional outputs may be
/// absent; temporary outputs are excluded from the cache entry entirely.
async fn validate_and_store_outputs(ctx: &BuildContext, fcm: &FileContentManager, pip: &Pip) -> Result<Vec<ContentHash>, BuildError> {
    let process = pip.as_process();
    let mut hashes = Vec::with_capacity(pip.declared_outputs.len());

    for output in &pip.declared_outputs {
        use bxl_types::artifact::ExistenceAttribute::*;
        let path = &output.artifact.path;
        let exists = tokio::fs::try_exists(path).await.unwrap_or(false);

        match output.existence {
            Required if !exists => {
                return Err(BuildError::InvalidInput {
                    message: format!("required output missing: {}", path.display()),
                });
            }
            Temporary => continue,
            _ => {}
        }

        if !exists {
            hashes.push(ContentHash::ABSENT);
            continue;
        }

        let mode = process
            .map(|p| {
                if p.options.contains(ProcessOptions::OUTPUTS_MUST_REMAIN_WRITABLE) {
                    RealizationMode::Copy
                } else {
                    RealizationMode::HardLinkOrCopy
                }
            })
            .unwrap_or(RealizationMode::Copy);

        let hash = ctx.cas.put(path, None, mode).await?;
        fcm.record(path.clone(), hash, mode, pip.id);
        hashes.push(hash);
    }

    Ok(hashes)
}

/// Runs the full §4.6 state-machine contract for a single `Process` pip:
/// weak fingerprint, lazy cache lookup, cache-hit replay, or cache-miss
/// execution through to publish and convergence.
#[instrument(skip(ctx, pip, manifest, driver, fcm), fields(pip_id = ?pip.id))]
pub async fn execute_pip(
    ctx: &BuildContext,
    pip: &Pip,
    executable_hash: Option<ContentHash>,
    manifest: &FileAccessManifest,
    driver: &impl SandboxDriver,
    fcm: &FileContentManager,
    fifo_dir: &Path,
) -> PipExecutionResult {
    if ctx.is_cancelled() {
        return PipExecutionResult {
            pip_id: pip.id,
            outcome: ExecutionOutcome::Failed,
            cacheable: false,
            cache_stats: CacheLookupStats::default(),
            error: Some(BuildError::Cancelled),
        };
    }

    let weak = Fingerprinter::weak_fingerprint(&WeakFingerprintInputs {
        pip,
        executable_hash,
        preserve_outputs_salt: ctx.preserve_outputs_salt,
        sandbox_safety_level: ctx.sandbox_safety_level,
    });

    // §4.4's sandbox-safety salt is a strict refinement, not a plain
    // equality gate: a lookup made at the current safety level also
    // accepts entries published under any safer level (the safer result
    // subsumes), so the lookup tries each subsuming level's weak
    // fingerprint in safest-first order before counting the pip a miss.
    let (existing, cache_stats) = {
        let mut stats = CacheLookupStats::default();
        let mut hit = None;
        for level in ctx.sandbox_safety_level.subsuming_levels() {
            let candidate_weak = Fingerprinter::weak_fingerprint(&WeakFingerprintInputs {
                pip,
                executable_hash,
                preserve_outputs_salt: ctx.preserve_outputs_salt,
                sandbox_safety_level: level,
            });
            match lookup_cache(ctx, candidate_weak).await {
                Ok((entry, level_stats)) => {
                    stats.visited_entries += level_stats.visited_entries;
                    stats.visited_absent_entries += level_stats.visited_absent_entries;
                    if entry.is_some() {
                        hit = entry;
                        break;
                    }
                }
                Err(err) => {
                    return PipExecutionResult {
                        pip_id: pip.id,
                        outcome: ExecutionOutcome::Failed,
                        cacheable: false,
                        cache_stats: stats,
                        error: Some(err),
                    };
                }
            }
        }
        (hit, stats)
    };

    if let Some(entry) = existing {
        if ctx.flags.warnings_cached {
            let _ = ctx.cas.load_available(std::slice::from_ref(&entry.metadata_hash)).await;
            if let bxl_cas::store::OpenStream::Found(meta_bytes) = ctx.cas.open_stream(&entry.metadata_hash).await {
                if let Ok(metadata) = serde_json::from_slice::<CacheEntryMetadata>(&meta_bytes) {
                    for warning in metadata.warnings {
                        warn!(pip_id = ?pip.id, warning, "warning-from-cache");
                    }
                }
            }
        }
        return match replay_cache_hit(ctx, fcm, pip, entry).await {
            Ok(outcome) => PipExecutionResult {
                pip_id: pip.id,
                outcome,
                cacheable: true,
                cache_stats,
                error: None,
            },
            Err(err) => PipExecutionResult {
                pip_id: pip.id,
                outcome: ExecutionOutcome::Failed,
                cacheable: false,
                cache_stats,
                error: Some(err),
            },
        };
    }

    if let Err(err) = materialize_inputs(ctx, fcm, pip).await {
        return PipExecutionResult {
            pip_id: pip.id,
            outcome: ExecutionOutcome::Failed,
            cacheable: false,
            cache_stats,
            error: Some(err),
        };
    }

    let execution = match &pip.kind {
        PipKind::Process(_) => execute_with_retries(ctx, pip, manifest, driver, fifo_dir).await,
        PipKind::CopyFile { .. } | PipKind::WriteFile { .. } => execute_direct_action(ctx, pip).await,
        other => Err(BuildError::InvalidInput {
            message: format!("pip kind {other:?} has no executor implementation"),
        }),
    };
    let execution = match execution {
        Ok(execution) => execution,
        Err(err) => {
            return PipExecutionResult {
                pip_id: pip.id,
                outcome: ExecutionOutcome::Failed,
                cacheable: false,
                cache_stats,
                error: Some(err),
            };
        }
    };

    let process = pip.as_process();
    let success = match process {
        Some(p) => execution.exit_code.is_some_and(|code| p.success_exit_codes.contains(&code)),
        None => true,
    };
    if !success {
        let process = process.expect("non-process execution is always successful");
        return PipExecutionResult {
            pip_id: pip.id,
            outcome: ExecutionOutcome::Failed,
            cacheable: false,
            cache_stats,
            error: Some(BuildError::InvalidInput {
                message: format!("pip exited {:?}, expected one of {:?}", execution.exit_code, process.success_exit_codes),
            }),
        };
    }

    let output_hashes = match validate_and_store_outputs(ctx, fcm, pip).await {
        Ok(hashes) => hashes,
        Err(err) => {
            return PipExecutionResult {
                pip_id: pip.id,
                outcome: ExecutionOutcome::Failed,
                cacheable: false,
                cache_stats,
                error: Some(err),
            };
        }
    };

    let uncacheable_exit = process.is_some_and(|p| execution.exit_code.is_some_and(|code| p.uncacheable_exit_codes.contains(&code)));
    let cacheable = execution.cacheable && !uncacheable_exit;

    if !cacheable {
        fcm.record_origin(pip.id, OutputOrigin::Produced);
        return PipExecutionResult {
            pip_id: pip.id,
            outcome: ExecutionOutcome::Succeeded,
            cacheable: false,
            cache_stats,
            error: None,
        };
    }

    let strong = Fingerprinter::strong_fingerprint(weak, execution.path_set_hash, &execution.observed);

    let stdout_hash = if execution.stdout.is_empty() { None } else { ctx.cas.store(&execution.stdout, None).await.ok() };
    let stderr_hash = if execution.stderr.is_empty() { None } else { ctx.cas.store(&execution.stderr, None).await.ok() };
    let warnings = process
        .and_then(|p| p.warning_regex.as_ref())
        .and_then(|pattern| lazy_regex::Regex::new(pattern).ok())
        .map(|regex| {
            let combined = String::from_utf8_lossy(&[execution.stdout.as_slice(), execution.stderr.as_slice()].concat()).into_owned();
            regex.find_iter(&combined).map(|m| m.as_str().to_string()).collect::<Vec<_>>()
        })
        .filter(|_| ctx.flags.warnings_cached)
        .unwrap_or_default();

    let metadata = CacheEntryMetadata {
        output_paths: pip.declared_outputs.iter().map(|o| o.artifact.path.clone()).collect(),
        stdout_hash,
        stderr_hash,
        warnings,
        output_existence: pip.declared_outputs.iter().map(|o| o.existence).collect(),
    };
    let metadata_bytes = match serde_json::to_vec(&metadata) {
        Ok(bytes) => bytes,
        Err(err) => {
            return PipExecutionResult {
                pip_id: pip.id,
                outcome: ExecutionOutcome::Failed,
                cacheable: false,
                cache_stats,
                error: Some(BuildError::InternalError { message: err.to_string() }),
            };
        }
    };
    let metadata_hash = match ctx.cas.store(&metadata_bytes, None).await {
        Ok(hash) => hash,
        Err(err) => {
            return PipExecutionResult {
                pip_id: pip.id,
                outcome: ExecutionOutcome::Failed,
                cacheable: false,
                cache_stats,
                error: Some(err),
            };
        }
    };

    let entry = CacheEntry {
        strong_fingerprint: strong,
        output_hashes,
        metadata_hash,
    };

    let publish = ctx
        .tpfs
        .publish(weak, execution.path_set_hash, strong, entry.clone(), PublishMode::CreateNew)
        .await;

    match publish {
        Ok(PublishResult::Published) => {
            fcm.record_origin(pip.id, OutputOrigin::Produced);
            PipExecutionResult {
                pip_id: pip.id,
                outcome: ExecutionOutcome::Succeeded,
                cacheable: true,
                cache_stats,
                error: None,
            }
        }
        Ok(PublishResult::Conflict(winner)) => {
            // §4.6 step 6 convergence: someone else published first. Deploy
            // the winner's outputs and record the execution as
            // `DeployedFromCache` rather than overstating our own cache
            // effectiveness with a locally computed miss.
            match replay_cache_hit(ctx, fcm, pip, winner).await {
                Ok(_) => PipExecutionResult {
                    pip_id: pip.id,
                    outcome: ExecutionOutcome::DeployedFromCache,
                    cacheable: true,
                    cache_stats,
                    error: None,
                },
                Err(err) => PipExecutionResult {
                    pip_id: pip.id,
                    outcome: ExecutionOutcome::Failed,
                    cacheable: false,
                    cache_stats,
                    error: Some(err),
                },
            }
        }
        Err(err) => PipExecutionResult {
            pip_id: pip.id,
            outcome: ExecutionOutcome::Failed,
            cacheable: false,
            cache_stats,
            error: Some(BuildError::CacheFailure { message: format!("{err:#}") }),
        },
    }
}

#[cfg(test)]
mod tests {
    use bxl_cas::Store as CasStore;
    use bxl_cas::local::LocalCasSite;
    use bxl_sandbox::driver::SimulatedSandbox;
    use bxl_sandbox::event::{EventKind, SandboxEvent};
    use bxl_tpfs::Store as TpfsStore;
    use bxl_tpfs::local::LocalTpfs;
    use bxl_types::pip::{PipKind, ProcessOptions, ProcessPip};
    use bxl_types::{DirectoryArtifact, ExistenceAttribute, FileArtifact, MountTable, PreserveOutputsSalt, SandboxSafetyLevel};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::context::BuildFlags;

    async fn harness() -> (BuildContext, tempfile::TempDir, FileContentManager) {
        let temp = tempfile::tempdir().unwrap();
        let cas = Arc::new(CasStore::new(LocalCasSite::new(temp.path().join("cas")), None));
        let tpfs = Arc::new(TpfsStore::new(LocalTpfs::in_memory().unwrap(), None));
        let ctx = BuildContext::new(
            cas,
            tpfs,
            Arc::new(MountTable::default()),
            PreserveOutputsSalt::default(),
            SandboxSafetyLevel::Monitored,
            BuildFlags::default(),
        );
        (ctx, temp, FileContentManager::new())
    }

    fn echo_pip(id: u64, output: PathBuf) -> Pip {
        Pip {
            id: PipId(id),
            declared_file_inputs: vec![],
            declared_directory_inputs: vec![],
            order_only_dependencies: vec![],
            declared_outputs: vec![bxl_types::pip::DeclaredOutput {
                artifact: FileArtifact::output(output, 1),
                existence: ExistenceAttribute::Required,
            }],
            declared_directory_outputs: vec![],
            kind: PipKind::Process(ProcessPip {
                executable: "/bin/sh".into(),
                arguments: vec![],
                environment: vec![],
                pass_through_env: vec![],
                working_dir: "/".into(),
                untracked_paths: vec![],
                untracked_scopes: vec![],
                success_exit_codes: vec![0],
                retry_exit_codes: vec![],
                uncacheable_exit_codes: vec![],
                warning_regex: None,
                error_regex: None,
                semaphore_requirements: vec![],
                timeout: None,
                options: ProcessOptions::NONE,
            }),
        }
    }

    #[tokio::test]
    async fn cache_miss_executes_validates_and_publishes() {
        let (ctx, temp, fcm) = harness().await;
        let output = temp.path().join("out.txt");
        tokio::fs::write(&output, b"built").await.unwrap();

        let pip = echo_pip(1, output.clone());
        let manifest = FileAccessManifest::new();
        let driver = SimulatedSandbox::new().script(1, vec![SandboxEvent::new("openat", EventKind::Open, 1, 0, "/dev/null")], 0);

        let result = execute_pip(&ctx, &pip, None, &manifest, &driver, &fcm, temp.path()).await;

        assert_eq!(result.outcome, ExecutionOutcome::Succeeded);
        assert!(result.cacheable);
        assert!(result.error.is_none());
        assert_eq!(fcm.origin_of(PipId(1)), Some(OutputOrigin::Produced));
    }

    #[tokio::test]
    async fn missing_required_output_fails_validation() {
        let (ctx, temp, fcm) = harness().await;
        let output = temp.path().join("never-written.txt");

        let pip = echo_pip(2, output);
        let manifest = FileAccessManifest::new();
        let driver = SimulatedSandbox::new().script(2, vec![], 0);

        let result = execute_pip(&ctx, &pip, None, &manifest, &driver, &fcm, temp.path()).await;

        assert_eq!(result.outcome, ExecutionOutcome::Failed);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn nonzero_exit_outside_success_codes_fails() {
        let (ctx, temp, fcm) = harness().await;
        let output = temp.path().join("out.txt");
        tokio::fs::write(&output, b"built").await.unwrap();

        let pip = echo_pip(3, output);
        let manifest = FileAccessManifest::new();
        let driver = SimulatedSandbox::new().script(3, vec![], 1);

        let result = execute_pip(&ctx, &pip, None, &manifest, &driver, &fcm, temp.path()).await;
        assert_eq!(result.outcome, ExecutionOutcome::Failed);
    }

    #[tokio::test]
    async fn cache_hit_survives_a_safety_downgrade() {
        // §4.4 + §8 scenario 3: a pip cached under `Monitored` is still a
        // hit when re-run at `Unmonitored` (the safer result subsumes).
        let (mut ctx, temp, fcm) = harness().await;
        let output = temp.path().join("out.txt");
        tokio::fs::write(&output, b"built").await.unwrap();

        let pip = echo_pip(10, output.clone());
        let manifest = FileAccessManifest::new();
        let driver = SimulatedSandbox::new().script(10, vec![], 0);

        ctx.sandbox_safety_level = SandboxSafetyLevel::Monitored;
        let first = execute_pip(&ctx, &pip, None, &manifest, &driver, &fcm, temp.path()).await;
        assert_eq!(first.outcome, ExecutionOutcome::Succeeded);

        tokio::fs::remove_file(&output).await.unwrap();
        ctx.sandbox_safety_level = SandboxSafetyLevel::Unmonitored;
        let second = execute_pip(&ctx, &pip, None, &manifest, &driver, &fcm, temp.path()).await;
        assert_eq!(second.outcome, ExecutionOutcome::DeployedFromCache);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), b"built");
    }

    fn write_file_pip(id: u64, destination: PathBuf, contents: &[u8]) -> Pip {
        Pip {
            id: PipId(id),
            declared_file_inputs: vec![],
            declared_directory_inputs: vec![],
            order_only_dependencies: vec![],
            declared_outputs: vec![bxl_types::pip::DeclaredOutput {
                artifact: FileArtifact::output(destination.clone(), 1),
                existence: ExistenceAttribute::Required,
            }],
            declared_directory_outputs: vec![],
            kind: PipKind::WriteFile {
                destination: FileArtifact::output(destination, 1),
                contents: contents.to_vec(),
            },
        }
    }

    fn copy_file_pip(id: u64, source: PathBuf, destination: PathBuf) -> Pip {
        Pip {
            id: PipId(id),
            declared_file_inputs: vec![FileArtifact::source(source.clone())],
            declared_directory_inputs: vec![],
            order_only_dependencies: vec![],
            declared_outputs: vec![bxl_types::pip::DeclaredOutput {
                artifact: FileArtifact::output(destination.clone(), 1),
                existence: ExistenceAttribute::Required,
            }],
            declared_directory_outputs: vec![],
            kind: PipKind::CopyFile {
                source: FileArtifact::source(source),
                destination: FileArtifact::output(destination, 1),
            },
        }
    }

    #[tokio::test]
    async fn write_file_is_up_to_date_on_rerun() {
        // §8 scenario 1.
        let (ctx, temp, fcm) = harness().await;
        let dest = temp.path().join("dest");
        let pip = write_file_pip(20, dest.clone(), b"Success");
        let manifest = FileAccessManifest::new();
        let driver = SimulatedSandbox::new();

        let first = execute_pip(&ctx, &pip, None, &manifest, &driver, &fcm, temp.path()).await;
        assert_eq!(first.outcome, ExecutionOutcome::Succeeded);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"Success");

        let second = execute_pip(&ctx, &pip, None, &manifest, &driver, &fcm, temp.path()).await;
        assert_eq!(second.outcome, ExecutionOutcome::UpToDate);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"Success");
    }

    #[tokio::test]
    async fn copy_file_deploys_from_cache_after_destination_delete() {
        // §8 scenario 2.
        let (ctx, temp, fcm) = harness().await;
        let source = temp.path().join("source");
        tokio::fs::write(&source, b"Matches!").await.unwrap();
        let dest = temp.path().join("dest");
        let pip = copy_file_pip(21, source, dest.clone());
        let manifest = FileAccessManifest::new();
        let driver = SimulatedSandbox::new();

        let first = execute_pip(&ctx, &pip, None, &manifest, &driver, &fcm, temp.path()).await;
        assert_eq!(first.outcome, ExecutionOutcome::Succeeded);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"Matches!");

        let second = execute_pip(&ctx, &pip, None, &manifest, &driver, &fcm, temp.path()).await;
        assert_eq!(second.outcome, ExecutionOutcome::UpToDate);

        tokio::fs::remove_file(&dest).await.unwrap();
        let third = execute_pip(&ctx, &pip, None, &manifest, &driver, &fcm, temp.path()).await;
        assert_eq!(third.outcome, ExecutionOutcome::DeployedFromCache);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"Matches!");
    }
}
