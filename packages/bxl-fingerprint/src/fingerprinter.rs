//! Weak and strong fingerprint computation (§3, §4.4).
//!
//! Grounded on `hurry/src/cargo/fingerprint.rs`'s `Fingerprint`: the same
//! discipline of reducing a build action to a canonical, order-independent
//! list of fields before taking a single stable hash over it.

use bxl_types::{ObservedInput, Pip, PipKind, PreserveOutputsSalt, SandboxSafetyLevel};

use crate::stable_hash::stable_hash_256;
use bxl_types::{StrongFingerprint, WeakFingerprint};

/// Everything the weak fingerprint is computed over, besides the pip's own
/// declared fields.
///
/// `executable_hash` is `None` for pip kinds without an executable (anything
/// but `Process`); the caller resolves it via the content-addressed store
/// before calling in, since hashing a live executable is an I/O operation
/// this crate deliberately stays out of.
pub struct WeakFingerprintInputs<'a> {
    pub pip: &'a Pip,
    pub executable_hash: Option<bxl_types::ContentHash>,
    pub preserve_outputs_salt: PreserveOutputsSalt,
    pub sandbox_safety_level: SandboxSafetyLevel,
}

/// A textual record of the canonical fields that went into a weak
/// fingerprint, for debugging divergent-fingerprint reports. Only populated
/// when tracing is requested — building it unconditionally would mean paying
/// for string formatting on every cache check.
pub struct FingerprintTrace {
    pub fields: Vec<String>,
}

pub struct Fingerprinter;

impl Fingerprinter {
    /// Compute a pip's weak fingerprint: a hash of its static declaration
    /// plus the session's salts. Two pips with identical declared inputs,
    /// outputs, and options hash identically regardless of the order their
    /// containers were built in — each sub-list is sorted before hashing, so
    /// the result depends only on set membership, not on iteration order.
    pub fn weak_fingerprint(inputs: &WeakFingerprintInputs<'_>) -> WeakFingerprint {
        let fields = Self::canonical_fields(inputs);
        WeakFingerprint::from_bytes(stable_hash_256(&fields))
    }

    /// Same computation as [`Self::weak_fingerprint`], but also returns the
    /// canonical field list that produced it, for debugging.
    pub fn weak_fingerprint_traced(
        inputs: &WeakFingerprintInputs<'_>,
    ) -> (WeakFingerprint, FingerprintTrace) {
        let fields = Self::canonical_fields(inputs);
        let fingerprint = WeakFingerprint::from_bytes(stable_hash_256(&fields));
        (fingerprint, FingerprintTrace { fields })
    }

    fn canonical_fields(inputs: &WeakFingerprintInputs<'_>) -> Vec<String> {
        let pip = inputs.pip;
        let mut fields = Vec::new();

        fields.push(format!("kind:{}", pip_kind_tag(&pip.kind)));
        if let Some(hash) = inputs.executable_hash {
            fields.push(format!("executable:{}", hash.to_hex()));
        }

        if let PipKind::Process(process) = &pip.kind {
            for arg in &process.arguments {
                fields.push(format!("arg:{arg}"));
            }

            let mut env: Vec<&(String, String)> = process
                .environment
                .iter()
                .filter(|(name, _)| !process.pass_through_env.contains(name))
                .collect();
            env.sort();
            for (name, value) in env {
                fields.push(format!("env:{name}={value}"));
            }

            let mut semaphores: Vec<String> = process
                .semaphore_requirements
                .iter()
                .map(|(name, count)| format!("semaphore:{name}={count}"))
                .collect();
            semaphores.sort();
            fields.extend(semaphores);

            fields.push(format!("options:{:?}", process.options));
            fields.push(format!(
                "success_exit_codes:{:?}",
                sorted(&process.success_exit_codes)
            ));
        }

        if let PipKind::CopyFile { source, destination } = &pip.kind {
            fields.push(format!("copy_source:{}", source.path.display()));
            fields.push(format!("copy_destination:{}", destination.path.display()));
        }

        if let PipKind::WriteFile { destination, contents } = &pip.kind {
            fields.push(format!("write_destination:{}", destination.path.display()));
            fields.push(format!(
                "write_contents:{}",
                bxl_types::ContentHash::from_buffer(contents).to_hex()
            ));
        }

        let mut file_inputs: Vec<String> = pip
            .declared_file_inputs
            .iter()
            .map(|input| format!("file_in:{}:{}", input.path.display(), input.write_count))
            .collect();
        file_inputs.sort();
        fields.extend(file_inputs);

        let mut dir_inputs: Vec<String> = pip
            .declared_directory_inputs
            .iter()
            .map(|input| {
                format!(
                    "dir_in:{}:{}:{}",
                    input.path.display(),
                    input.partial_seal_id,
                    input.is_shared_opaque
                )
            })
            .collect();
        dir_inputs.sort();
        fields.extend(dir_inputs);

        let mut file_outputs: Vec<String> = pip
            .declared_outputs
            .iter()
            .map(|output| {
                format!(
                    "file_out:{}:{:?}",
                    output.artifact.path.display(),
                    output.existence
                )
            })
            .collect();
        file_outputs.sort();
        fields.extend(file_outputs);

        let mut dir_outputs: Vec<String> = pip
            .declared_directory_outputs
            .iter()
            .map(|output| format!("dir_out:{}", output.path.display()))
            .collect();
        dir_outputs.sort();
        fields.extend(dir_outputs);

        // `order_only_dependencies` is intentionally excluded: it enforces
        // scheduling order and contributes to neither the fingerprint nor
        // the path set (see `Pip::order_only_dependencies`'s doc comment).

        fields.push(format!(
            "preserve_outputs_salt:{}",
            hex::encode(inputs.preserve_outputs_salt.0)
        ));
        fields.push(format!(
            "sandbox_safety_level:{:?}",
            inputs.sandbox_safety_level
        ));

        fields
    }

    /// Compute a pip's strong fingerprint: a hash of the weak fingerprint,
    /// the canonicalized path-set hash, and the observed inputs recorded
    /// against it during the prior execution that populated this candidate.
    ///
    /// `observed` is expected in the same canonical order as the path set it
    /// was recorded against, so the hash is a pure function of the triple
    /// regardless of which TPFS candidate produced it.
    pub fn strong_fingerprint(
        weak: WeakFingerprint,
        path_set_hash: [u8; 32],
        observed: &[ObservedInput],
    ) -> StrongFingerprint {
        let mut fields: Vec<String> = Vec::with_capacity(observed.len() + 2);
        fields.push(format!("weak:{weak}"));
        fields.push(format!("path_set:{}", hex::encode(path_set_hash)));
        for input in observed {
            fields.push(format!(
                "observed:{}:{:?}",
                serde_json::to_string(&input.entry).unwrap_or_default(),
                input.value
            ));
        }
        StrongFingerprint::from_bytes(stable_hash_256(&fields))
    }
}

fn pip_kind_tag(kind: &PipKind) -> &'static str {
    match kind {
        PipKind::Process(_) => "process",
        PipKind::CopyFile { .. } => "copy_file",
        PipKind::WriteFile { .. } => "write_file",
        PipKind::SealDirectory { .. } => "seal_directory",
        PipKind::Ipc { .. } => "ipc",
        PipKind::HashSourceFile { .. } => "hash_source_file",
        PipKind::Value { .. } => "value",
        PipKind::SpecFile { .. } => "spec_file",
        PipKind::Module { .. } => "module",
    }
}

fn sorted(values: &[i32]) -> Vec<i32> {
    let mut out = values.to_vec();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use bxl_types::{DeclaredOutput, ExistenceAttribute, FileArtifact, PipId, ProcessPip};
    use pretty_assertions::assert_eq;

    use super::*;

    fn process_pip(arguments: Vec<&str>, environment: Vec<(&str, &str)>) -> Pip {
        Pip {
            id: PipId(1),
            declared_file_inputs: vec![FileArtifact {
                path: PathBuf::from("/src/main.rs"),
                write_count: 1,
            }],
            declared_directory_inputs: vec![],
            order_only_dependencies: vec![],
            declared_outputs: vec![DeclaredOutput {
                artifact: FileArtifact {
                    path: PathBuf::from("/out/main.o"),
                    write_count: 1,
                },
                existence: ExistenceAttribute::Required,
            }],
            declared_directory_outputs: vec![],
            kind: PipKind::Process(ProcessPip {
                executable: PathBuf::from("/usr/bin/cc"),
                arguments: arguments.into_iter().map(String::from).collect(),
                environment: environment
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                pass_through_env: vec!["PATH".to_string()],
                working_dir: PathBuf::from("/src"),
                untracked_paths: vec![],
                untracked_scopes: vec![],
                success_exit_codes: vec![0],
                retry_exit_codes: vec![],
                uncacheable_exit_codes: vec![],
                warning_regex: None,
                error_regex: None,
                semaphore_requirements: vec![],
                timeout: None,
                options: bxl_types::ProcessOptions::NONE,
            }),
        }
    }

    fn inputs(pip: &Pip) -> WeakFingerprintInputs<'_> {
        WeakFingerprintInputs {
            pip,
            executable_hash: Some(bxl_types::ContentHash::from_buffer(b"cc-binary")),
            preserve_outputs_salt: PreserveOutputsSalt::default(),
            sandbox_safety_level: SandboxSafetyLevel::Monitored,
        }
    }

    #[test]
    fn identical_pips_fingerprint_identically() {
        let a = process_pip(vec!["-c", "main.c"], vec![("CC", "gcc")]);
        let b = process_pip(vec!["-c", "main.c"], vec![("CC", "gcc")]);
        assert_eq!(
            Fingerprinter::weak_fingerprint(&inputs(&a)),
            Fingerprinter::weak_fingerprint(&inputs(&b))
        );
    }

    #[test]
    fn argument_order_is_significant() {
        let a = process_pip(vec!["-c", "main.c"], vec![]);
        let b = process_pip(vec!["main.c", "-c"], vec![]);
        assert_ne!(
            Fingerprinter::weak_fingerprint(&inputs(&a)),
            Fingerprinter::weak_fingerprint(&inputs(&b))
        );
    }

    #[test]
    fn environment_insertion_order_is_not_significant() {
        let a = process_pip(vec![], vec![("CC", "gcc"), ("CFLAGS", "-O2")]);
        let b = process_pip(vec![], vec![("CFLAGS", "-O2"), ("CC", "gcc")]);
        assert_eq!(
            Fingerprinter::weak_fingerprint(&inputs(&a)),
            Fingerprinter::weak_fingerprint(&inputs(&b))
        );
    }

    #[test]
    fn pass_through_env_does_not_affect_the_fingerprint() {
        let mut a = process_pip(vec![], vec![("CC", "gcc")]);
        let mut b = process_pip(vec![], vec![("CC", "gcc")]);
        if let PipKind::Process(p) = &mut a.kind {
            p.pass_through_env = vec!["PATH".to_string()];
        }
        if let PipKind::Process(p) = &mut b.kind {
            p.pass_through_env = vec!["PATH".to_string(), "HOME".to_string()];
        }
        assert_eq!(
            Fingerprinter::weak_fingerprint(&inputs(&a)),
            Fingerprinter::weak_fingerprint(&inputs(&b))
        );
    }

    #[test]
    fn differing_preserve_outputs_salt_forces_a_different_fingerprint() {
        let pip = process_pip(vec!["-c"], vec![]);
        let mut first = inputs(&pip);
        let mut second = inputs(&pip);
        first.preserve_outputs_salt = PreserveOutputsSalt([1u8; 16]);
        second.preserve_outputs_salt = PreserveOutputsSalt([2u8; 16]);
        assert_ne!(
            Fingerprinter::weak_fingerprint(&first),
            Fingerprinter::weak_fingerprint(&second)
        );
    }

    #[test]
    fn traced_fingerprint_matches_untraced_fingerprint() {
        let pip = process_pip(vec!["-c"], vec![("CC", "gcc")]);
        let (traced, trace) = Fingerprinter::weak_fingerprint_traced(&inputs(&pip));
        assert_eq!(traced, Fingerprinter::weak_fingerprint(&inputs(&pip)));
        assert!(trace.fields.iter().any(|f| f.starts_with("arg:")));
        assert!(trace.fields.iter().any(|f| f.starts_with("env:CC=gcc")));
    }

    #[test]
    fn strong_fingerprint_changes_when_observed_inputs_change() {
        use bxl_types::{AccessType, ObservedValue, PathSetEntry};

        let weak = WeakFingerprint::from_bytes([7u8; 32]);
        let path_set_hash = [9u8; 32];
        let a = vec![ObservedInput {
            entry: PathSetEntry {
                path: PathBuf::from("/src/main.rs"),
                access_type: AccessType::FileContentRead,
            },
            value: ObservedValue::Content(bxl_types::ContentHash::from_buffer(b"v1")),
        }];
        let b = vec![ObservedInput {
            entry: PathSetEntry {
                path: PathBuf::from("/src/main.rs"),
                access_type: AccessType::FileContentRead,
            },
            value: ObservedValue::Content(bxl_types::ContentHash::from_buffer(b"v2")),
        }];
        assert_ne!(
            Fingerprinter::strong_fingerprint(weak, path_set_hash, &a),
            Fingerprinter::strong_fingerprint(weak, path_set_hash, &b)
        );
    }
}
