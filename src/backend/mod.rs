//! The abstract hypervisor backend capability (SPEC_FULL.md §4.5).
//!
//! The monitor never talks to `/dev/kvm` directly - every interaction
//! with "the hypervisor" goes through this trait, so the call loop in
//! `crate::monitor` can run against a real KVM VM or against an
//! in-process stub with no code changes.

pub mod kvm;
pub mod stub;

pub use kvm::KvmBackend;
pub use stub::StubBackend;

use crate::error::Result;
use crate::memory::MemoryMap;
use crate::x86::X86CpuState;

/// Direction of an I/O exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoDirection {
    In,
    Out,
}

/// A single VM exit the monitor needs to react to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Exit {
    /// The guest performed a port I/O access.
    Io {
        port: u16,
        size: u8,
        direction: IoDirection,
        /// Zero-padded to 32 bits, little-endian.
        data: u32,
    },
    /// Any other exit reason. The backend never fails on these - it
    /// hands the tag back and lets the monitor decide (which, per
    /// §4.6, always means `Error::Unsupported`).
    Unknown,
}

/// Capability set a hypervisor backend must provide.
///
/// `Vm` is the backend's opaque per-environment handle (one VM, one
/// vCPU with APIC id 0, plus whatever shared "run area" the backend
/// needs for exit data).
pub trait Backend {
    type Vm;

    /// One-time capability check: must succeed if the backend can create
    /// at least one 1-vCPU VM with at least 16 memory slots.
    fn probe() -> Result<()>
    where
        Self: Sized;

    /// Creates a new VM with one vCPU.
    fn create_vm(&self) -> Result<Self::Vm>;

    /// Releases the VM, its vCPU, and its run area. Safe to call on a
    /// partially-initialized handle.
    fn release_vm(&self, vm: Self::Vm);

    /// Replaces the backend's memory slot table with `map`'s regions,
    /// assigned to slots 0..N-1 in iteration order. Fails with
    /// `Error::NoSpace` if `map` has more regions than available slots.
    fn install_memory_map(&self, vm: &mut Self::Vm, map: &MemoryMap) -> Result<()>;

    /// Loads the given architectural snapshot into the vCPU.
    fn load_vcpu_state(&self, vm: &mut Self::Vm, state: &X86CpuState) -> Result<()>;

    /// Reads the vCPU's current architectural snapshot back, OR-merging
    /// observed segment flag bits into `state` rather than overwriting
    /// them (see `Segment::merge_from_backend`).
    fn store_vcpu_state(&self, vm: &Self::Vm, state: &mut X86CpuState) -> Result<()>;

    /// Resumes the vCPU until the next exit the monitor cares about.
    /// Blocks the calling thread.
    fn run(&self, vm: &mut Self::Vm) -> Result<Exit>;
}
