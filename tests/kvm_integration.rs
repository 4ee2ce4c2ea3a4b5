//! End-to-end scenarios 1-4 from SPEC_FULL.md §8 against a real `/dev/kvm`
//! VM. `#[ignore]`d by default - run explicitly with
//! `cargo test --test kvm_integration -- --ignored` on a host where the
//! calling user has access to `/dev/kvm`. Mirrors the teacher's own
//! KVM-dependent `#[test] fn vm_loads_kernel_elf_from_build_script`.

use std::os::unix::fs::PermissionsExt;

use ivee::backend::KvmBackend;
use ivee::{ArchState, Environment, Error, ExecutableFormat};

fn write_flat_binary(name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("ivee-kvm-integration-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// `add rax, rcx; add rax, rdx; out 0x78, al`
const ADD_THEN_TERMINATE: &[u8] = &[0x48, 0x01, 0xC8, 0x48, 0x01, 0xD0, 0xE6, 0x78];
/// `out 0x78, al`
const IMMEDIATE_TERMINATE: &[u8] = &[0xE6, 0x78];
/// `out 0x79, al`
const UNEXPECTED_PORT: &[u8] = &[0xE6, 0x79];
/// `hlt`
const HALT: &[u8] = &[0xF4];

#[test]
#[ignore = "requires /dev/kvm access"]
fn add_then_terminate() {
    let path = write_flat_binary("add.bin", ADD_THEN_TERMINATE);
    let mut env = Environment::create(0, KvmBackend::new()).expect("create environment");
    env.load_executable(&path, ExecutableFormat::Bin).expect("load executable");

    let mut state = ArchState {
        rcx: 0xDEAD_F00D,
        rdx: 0xCAFE_BABE,
        ..Default::default()
    };
    env.call(&mut state).expect("call");
    assert_eq!(state.rax, 0x1_A9CA_E4CB);
}

#[test]
#[ignore = "requires /dev/kvm access"]
fn immediate_terminate_preserves_register() {
    let path = write_flat_binary("halt.bin", IMMEDIATE_TERMINATE);
    let mut env = Environment::create(0, KvmBackend::new()).expect("create environment");
    env.load_executable(&path, ExecutableFormat::Bin).expect("load executable");

    let mut state = ArchState { rax: 0x42, ..Default::default() };
    env.call(&mut state).expect("call");
    assert_eq!(state.rax, 0x42);
}

#[test]
#[ignore = "requires /dev/kvm access"]
fn unexpected_port_is_unsupported() {
    let path = write_flat_binary("bad_port.bin", UNEXPECTED_PORT);
    let mut env = Environment::create(0, KvmBackend::new()).expect("create environment");
    env.load_executable(&path, ExecutableFormat::Bin).expect("load executable");

    let mut state = ArchState::default();
    let err = env.call(&mut state).unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
}

#[test]
#[ignore = "requires /dev/kvm access"]
fn halt_is_unsupported() {
    let path = write_flat_binary("hlt.bin", HALT);
    let mut env = Environment::create(0, KvmBackend::new()).expect("create environment");
    env.load_executable(&path, ExecutableFormat::Bin).expect("load executable");

    let mut state = ArchState::default();
    let err = env.call(&mut state).unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
}
