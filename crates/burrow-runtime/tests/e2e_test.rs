//! End-to-end tests for the run pipeline against an in-process registry.
//!
//! Whether the isolation steps succeed depends on the privileges of the
//! test process. Unprivileged, tests that reach the isolator accept every
//! outcome it can legitimately produce and always check that the root is
//! gone; the exit status checks at the bottom only run as root.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::path::{Path, PathBuf};
use std::process::Command;

use burrow_common::config::{BurrowConfig, ExtractorKind};
use burrow_common::error::BurrowError;
use burrow_common::types::Termination;
use burrow_image::testing::{FakeRegistry, LayerEntry, gzip, tar_layer};
use burrow_runtime::engine::{Engine, RunRequest};
use burrow_runtime::isolate::run_isolated;
use burrow_runtime::rootfs::RootFs;

fn config_for(registry: &FakeRegistry, temp_root: &Path) -> BurrowConfig {
    BurrowConfig {
        temp_root: Some(temp_root.to_path_buf()),
        extractor: ExtractorKind::Builtin,
        ..registry.config()
    }
}

fn host_executable() -> Option<String> {
    which::which("true")
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

fn leftovers(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

fn image_layers() -> Vec<Vec<u8>> {
    vec![
        gzip(&tar_layer(&[
            LayerEntry::dir("etc"),
            LayerEntry::file("etc/os-release", b"NAME=lower\n", 0o644),
            LayerEntry::dir("tmp"),
        ])),
        gzip(&tar_layer(&[LayerEntry::file(
            "etc/os-release",
            b"NAME=upper\n",
            0o644,
        )])),
    ]
}

// ── Cleanup ──────────────────────────────────────────────────────────

#[test]
fn run_removes_root_whatever_the_isolation_outcome() {
    let Some(command) = host_executable() else {
        return;
    };
    let registry = FakeRegistry::builder()
        .image("library/busybox", &image_layers())
        .start();
    let temp = tempfile::tempdir().unwrap();
    let engine = Engine::new(config_for(&registry, temp.path()));

    let outcome = engine.run(&RunRequest {
        image: "busybox".into(),
        command,
        args: vec!["--ignored".into()],
    });

    if burrow_core::is_privileged() {
        // A dynamically linked copy finds no loader in the image.
        match outcome {
            Ok(termination) => assert_eq!(termination, Termination::Exited(0)),
            Err(BurrowError::Launch { not_found, .. }) => assert!(not_found),
            Err(other) => panic!("unexpected pipeline error: {other}"),
        }
    } else {
        assert!(matches!(
            outcome,
            Ok(_) | Err(BurrowError::Isolation { .. } | BurrowError::Launch { .. })
        ));
    }
    assert!(leftovers(temp.path()).is_empty());
}

#[test]
fn extraction_failure_removes_root() {
    let Some(command) = host_executable() else {
        return;
    };
    let mut corrupt = vec![0x1f, 0x8b];
    corrupt.extend_from_slice(b"not a deflate stream");
    let registry = FakeRegistry::builder()
        .image("library/busybox", &[corrupt])
        .start();
    let temp = tempfile::tempdir().unwrap();
    let engine = Engine::new(config_for(&registry, temp.path()));

    let err = engine
        .run(&RunRequest {
            image: "busybox".into(),
            command,
            args: Vec::new(),
        })
        .unwrap_err();

    assert!(matches!(err, BurrowError::Extraction { .. }));
    assert_eq!(err.exit_code(), 125);
    assert!(leftovers(temp.path()).is_empty());
}

#[test]
fn missing_host_executable_removes_root() {
    let registry = FakeRegistry::builder()
        .image("library/busybox", &image_layers())
        .start();
    let temp = tempfile::tempdir().unwrap();
    let engine = Engine::new(config_for(&registry, temp.path()));

    let err = engine
        .run(&RunRequest {
            image: "busybox".into(),
            command: "/definitely/not/a/real/binary".into(),
            args: Vec::new(),
        })
        .unwrap_err();

    assert!(matches!(err, BurrowError::RootFs { .. }));
    assert!(leftovers(temp.path()).is_empty());
}

// ── Registry failures ────────────────────────────────────────────────

#[test]
fn token_failure_creates_no_root() {
    let registry = FakeRegistry::builder()
        .image("library/busybox", &image_layers())
        .token_response(200, "{not json")
        .start();
    let temp = tempfile::tempdir().unwrap();
    let engine = Engine::new(config_for(&registry, temp.path()));

    let err = engine
        .run(&RunRequest {
            image: "busybox".into(),
            command: "/bin/ls".into(),
            args: vec!["/tmp/x".into()],
        })
        .unwrap_err();

    assert!(matches!(err, BurrowError::Auth { .. }));
    assert_eq!(registry.requests().len(), 1);
    assert!(leftovers(temp.path()).is_empty());
}

#[test]
fn missing_layer_creates_no_root() {
    let layers = image_layers();
    let digests = FakeRegistry::builder()
        .image("library/busybox", &layers)
        .start()
        .layer_digests("library/busybox");
    let registry = FakeRegistry::builder()
        .image("library/busybox", &layers)
        .without_blob(&digests[0])
        .start();
    let temp = tempfile::tempdir().unwrap();
    let engine = Engine::new(config_for(&registry, temp.path()));

    let err = engine
        .run(&RunRequest {
            image: "busybox".into(),
            command: "/bin/ls".into(),
            args: Vec::new(),
        })
        .unwrap_err();

    assert!(matches!(err, BurrowError::LayerFetch { .. }));
    assert!(leftovers(temp.path()).is_empty());
}

// ── External tar ─────────────────────────────────────────────────────

#[test]
fn external_tar_extractor_runs_through_the_pipeline() {
    if which::which("tar").is_err() {
        return;
    }
    let Some(command) = host_executable() else {
        return;
    };
    let registry = FakeRegistry::builder()
        .image("library/busybox", &image_layers())
        .start();
    let temp = tempfile::tempdir().unwrap();
    let engine = Engine::new(BurrowConfig {
        extractor: ExtractorKind::Tar,
        ..config_for(&registry, temp.path())
    });

    let outcome = engine.run(&RunRequest {
        image: "busybox".into(),
        command,
        args: Vec::new(),
    });

    assert!(matches!(
        outcome,
        Ok(_) | Err(BurrowError::Isolation { .. } | BurrowError::Launch { .. })
    ));
    assert!(leftovers(temp.path()).is_empty());
}

// ── Exit status (root only) ──────────────────────────────────────────

fn privileged_shell() -> Option<&'static str> {
    (burrow_core::is_privileged() && Path::new("/bin/sh").exists()).then_some("/bin/sh")
}

fn shell_args(script: &str) -> Vec<String> {
    vec!["-c".into(), script.into()]
}

/// Absolute paths `ldd` reports for `binary`; empty for static binaries.
fn shared_libraries(binary: &str) -> Vec<PathBuf> {
    let Ok(output) = Command::new("ldd").arg(binary).output() else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }
    String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .filter(|token| token.starts_with('/'))
        .map(PathBuf::from)
        .collect()
}

#[test]
fn exit_status_passes_through_isolation() {
    let Some(shell) = privileged_shell() else {
        return;
    };
    let termination = run_isolated(Path::new("/"), shell, &shell_args("exit 3")).unwrap();
    assert_eq!(termination, Termination::Exited(3));
    assert_eq!(termination.exit_code(), 3);
}

#[test]
fn command_is_the_first_process_of_its_namespace() {
    let Some(shell) = privileged_shell() else {
        return;
    };
    let termination = run_isolated(Path::new("/"), shell, &shell_args("exit $$")).unwrap();
    assert_eq!(termination, Termination::Exited(1));
}

#[test]
fn host_path_missing_from_root_is_not_found() {
    if !burrow_core::is_privileged() {
        return;
    }
    let parent = tempfile::tempdir().unwrap();
    let root = RootFs::create(parent.path()).unwrap();
    root.seed_dev_null().unwrap();

    let err = run_isolated(root.path(), "/bin/ls", &[]).unwrap_err();
    assert!(matches!(err, BurrowError::Launch { not_found: true, .. }));
    assert_eq!(err.exit_code(), 127);

    root.remove().unwrap();
    assert!(leftovers(parent.path()).is_empty());
}

#[test]
fn pipeline_returns_the_command_exit_status() {
    let Some(shell) = privileged_shell() else {
        return;
    };
    if which::which("ldd").is_err() {
        return;
    }
    let libraries: Vec<(String, Vec<u8>)> = shared_libraries(shell)
        .into_iter()
        .map(|lib| {
            let data = std::fs::read(&lib).unwrap();
            let relative = lib.strip_prefix("/").unwrap().to_string_lossy().into_owned();
            (relative, data)
        })
        .collect();
    let entries: Vec<LayerEntry> = libraries
        .iter()
        .map(|(path, data)| LayerEntry::file(path, data, 0o755))
        .collect();
    let registry = FakeRegistry::builder()
        .image("library/busybox", &[gzip(&tar_layer(&entries))])
        .start();
    let temp = tempfile::tempdir().unwrap();
    let engine = Engine::new(config_for(&registry, temp.path()));

    let termination = engine
        .run(&RunRequest {
            image: "busybox".into(),
            command: shell.into(),
            args: shell_args("exit $(( $$ + 6 ))"),
        })
        .unwrap();

    assert_eq!(termination, Termination::Exited(7));
    assert!(leftovers(temp.path()).is_empty());
}
