//! End-to-end scenarios 1-4 and 7 from SPEC_FULL.md §8, exercised against
//! `StubBackend` so they run without `/dev/kvm`. Mirrors the shape of
//! `original_source/tests/smoke_test.c`'s `raw_binary_smoke_test`.

use std::os::unix::fs::PermissionsExt;

use ivee::backend::{IoDirection, StubBackend};
use ivee::{ArchState, Environment, Error, ExecutableFormat};

fn write_flat_binary(name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("ivee-call-loop-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Scenario 1: the guest computes `rax = rcx + rdx` then writes the
/// terminate port.
#[test]
fn add_then_terminate() {
    let path = write_flat_binary("add.bin", &[0x90, 0x90]);
    let backend = StubBackend::with_effect(
        vec![ivee::backend::Exit::Io {
            port: 0x78,
            size: 4,
            direction: IoDirection::Out,
            data: 0,
        }],
        |state| state.rax = state.rcx.wrapping_add(state.rdx),
    );

    let mut env = Environment::create(0, backend).unwrap();
    env.load_executable(&path, ExecutableFormat::Bin).unwrap();

    let mut state = ArchState {
        rcx: 0xDEAD_F00D,
        rdx: 0xCAFE_BABE,
        ..Default::default()
    };
    env.call(&mut state).unwrap();
    assert_eq!(state.rax, 0x1_A9CA_E4CB);
}

/// Scenario 2: the guest immediately writes the terminate port, leaving
/// the caller's register untouched.
#[test]
fn immediate_terminate_preserves_register() {
    let path = write_flat_binary("halt.bin", &[0x90]);
    let backend = StubBackend::new(vec![ivee::backend::Exit::Io {
        port: 0x78,
        size: 4,
        direction: IoDirection::Out,
        data: 1,
    }]);

    let mut env = Environment::create(0, backend).unwrap();
    env.load_executable(&path, ExecutableFormat::Bin).unwrap();

    let mut state = ArchState { rax: 0x42, ..Default::default() };
    env.call(&mut state).unwrap();
    assert_eq!(state.rax, 0x42);
}

/// Scenario 3: a write to an unexpected I/O port surfaces `Unsupported`.
#[test]
fn unexpected_port_is_unsupported() {
    let path = write_flat_binary("bad_port.bin", &[0x90]);
    let backend = StubBackend::new(vec![ivee::backend::Exit::Io {
        port: 0x79,
        size: 1,
        direction: IoDirection::Out,
        data: 0,
    }]);

    let mut env = Environment::create(0, backend).unwrap();
    env.load_executable(&path, ExecutableFormat::Bin).unwrap();

    let mut state = ArchState::default();
    let err = env.call(&mut state).unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
}

/// Scenario 4: any exit the monitor doesn't recognize surfaces
/// `Unsupported`.
#[test]
fn unknown_exit_is_unsupported() {
    let path = write_flat_binary("hlt.bin", &[0xf4]);
    let mut env = Environment::create(0, StubBackend::unknown_exit()).unwrap();
    env.load_executable(&path, ExecutableFormat::Bin).unwrap();

    let mut state = ArchState::default();
    let err = env.call(&mut state).unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
}

/// Scenario 7: an unrecognized capability bit is rejected at creation
/// time, before any backend or memory map work happens.
#[test]
fn unrecognized_capability_is_unsupported() {
    let err = Environment::create(0x8000, StubBackend::new(vec![])).unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
}

/// A named but currently unimplemented capability bit (PAGE_FAULT_HANDLING)
/// is rejected just like an unrecognized one: `Capabilities::supported` is
/// empty today, so every nonzero bit is unsupported.
#[test]
fn named_but_unsupported_capability_is_unsupported() {
    let err = Environment::create(0x0001, StubBackend::new(vec![])).unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
}
