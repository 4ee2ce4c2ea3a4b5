//! End-to-end scenarios 5 and 6 from SPEC_FULL.md §8: executable-load
//! failure paths that need no running vCPU at all.

use std::os::unix::fs::PermissionsExt;

use ivee::backend::StubBackend;
use ivee::{Environment, Error, ExecutableFormat};

fn scratch_dir() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("ivee-load-executable-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Scenario 5: a zero-byte file is rejected and the environment's memory
/// map is left untouched.
#[test]
fn zero_byte_file_is_invalid_argument() {
    let path = scratch_dir().join("empty.bin");
    std::fs::write(&path, []).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();

    let mut env = Environment::create(0, StubBackend::new(vec![])).unwrap();
    let err = env.load_executable(&path, ExecutableFormat::Bin).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

/// Scenario 6: a path without read permission is rejected.
#[test]
fn unreadable_path_is_invalid_argument() {
    let path = scratch_dir().join("unreadable.bin");
    std::fs::write(&path, [0x90, 0x90]).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o000);
    std::fs::set_permissions(&path, perms).unwrap();

    let mut env = Environment::create(0, StubBackend::new(vec![])).unwrap();
    let err = env.load_executable(&path, ExecutableFormat::Bin).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    // Restore permissions so the scratch directory can be cleaned up by
    // later test runs without lingering unreadable files.
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o644);
    std::fs::set_permissions(&path, perms).unwrap();
}

/// A nonexistent path is likewise rejected rather than propagating a raw
/// I/O error.
#[test]
fn missing_path_is_invalid_argument() {
    let mut env = Environment::create(0, StubBackend::new(vec![])).unwrap();
    let err = env
        .load_executable(std::path::Path::new("/nonexistent/ivee/payload.bin"), ExecutableFormat::Bin)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}
