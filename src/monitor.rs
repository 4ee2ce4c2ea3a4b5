//! Environment lifecycle, executable load, and the synchronous call loop
//! (SPEC_FULL.md §4.6).
//!
//! Grounded on `original_source/src/libivee.c` (`ivee_create`,
//! `ivee_load_executable`, `load_bin`, `init_guest_page_table`) for the
//! exact step ordering, and on the teacher's `Vm::load_elf`/`Vm::run`
//! (`src/vm/mod.rs`) for the Rust idiom this module follows.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use log::{debug, info, warn};

use crate::backend::{Backend, Exit};
use crate::capabilities::Capabilities;
use crate::error::{Error, Result};
use crate::format::ExecutableFormat;
use crate::memory::{GuestProt, HostMemoryRegion, MemoryMap};
use crate::pagetable::{self, build_identity_page_tables};
use crate::x86::{build_boot_state, ArchState, X86CpuState};

/// The well-known I/O port a guest writes to in order to end a `call`.
pub const TERMINATE_PORT: u16 = 0x78;

/// An isolated execution environment: one backend VM, its memory map, and
/// the last architectural snapshot observed from it.
///
/// Not [`Sync`] - the backend VM handle (e.g. a `VcpuFd`/`VmFd` pair) is
/// only safe to drive from one thread at a time - but it is [`Send`], so
/// an environment may be handed off between threads as long as only one
/// touches it at a time. Concurrent use of two distinct environments is
/// fine.
pub struct Environment<B: Backend> {
    backend: B,
    vm: Option<B::Vm>,
    memory_map: MemoryMap,
    last_state: X86CpuState,
    should_terminate: bool,
}

impl<B: Backend> Environment<B> {
    /// Creates a new environment backed by `backend`.
    ///
    /// `capabilities` is a raw bit-set; any bit outside
    /// [`Capabilities::supported`] is rejected with `Unsupported` (today
    /// that means any nonzero value, since no capability is actually
    /// implemented).
    pub fn create(capabilities: u64, backend: B) -> Result<Self> {
        if capabilities & !Capabilities::supported().bits() != 0 {
            return Err(Error::Unsupported("unrecognized capability bit"));
        }

        B::probe()?;
        let vm = backend.create_vm()?;
        info!("execution environment created");

        Ok(Self {
            backend,
            vm: Some(vm),
            memory_map: MemoryMap::new(),
            last_state: X86CpuState::default(),
            should_terminate: false,
        })
    }

    fn vm_mut(&mut self) -> &mut B::Vm {
        self.vm.as_mut().expect("environment vm missing after destroy")
    }

    fn vm_ref(&self) -> &B::Vm {
        self.vm.as_ref().expect("environment vm missing after destroy")
    }

    /// Loads a flat binary image into guest physical memory, builds the
    /// identity page tables, and installs both into the backend.
    ///
    /// `format` is checked but `ExecutableFormat::Any` currently behaves
    /// identically to `ExecutableFormat::Bin` - no format probing is
    /// implemented.
    pub fn load_executable(&mut self, path: &Path, format: ExecutableFormat) -> Result<()> {
        match format {
            ExecutableFormat::Bin | ExecutableFormat::Any => {}
        }

        check_read_execute_access(path)?;
        self.load_bin(path)?;

        let page_tables = build_identity_page_tables()?;
        self.memory_map
            .map_region(&page_tables, pagetable::PML4_BASE_GPA, GuestProt::READ)?;
        drop(page_tables);

        self.backend.install_memory_map(self.vm_mut(), &self.memory_map)?;
        debug!("installed {} guest memory region(s)", self.memory_map.len());
        Ok(())
    }

    fn load_bin(&mut self, path: &Path) -> Result<()> {
        let image = HostMemoryRegion::from_file_readonly(path)?;
        self.memory_map.map_region(&image, 0, GuestProt::READ)?;
        drop(image);
        Ok(())
    }

    /// Executes a synchronous call into the guest: loads `state` into the
    /// vCPU, runs until the guest writes to [`TERMINATE_PORT`], and copies
    /// the resulting general-purpose registers back into `state`.
    pub fn call(&mut self, state: &mut ArchState) -> Result<()> {
        let boot_state = build_boot_state(state, pagetable::PML4_BASE_GPA);
        self.backend.load_vcpu_state(self.vm_mut(), &boot_state)?;
        self.last_state = boot_state;
        self.should_terminate = false;

        while !self.should_terminate {
            let exit = self.backend.run(self.vm_mut())?;
            self.dispatch(exit)?;
        }

        self.backend.store_vcpu_state(self.vm_ref(), &mut self.last_state)?;
        *state = self.last_state.to_arch_state();
        Ok(())
    }

    fn dispatch(&mut self, exit: Exit) -> Result<()> {
        match exit {
            Exit::Io { port, .. } if port == TERMINATE_PORT => {
                self.should_terminate = true;
                Ok(())
            }
            Exit::Io { port, .. } => {
                warn!("guest exited on unexpected port {:#x}", port);
                Err(Error::Unsupported("unexpected I/O port"))
            }
            Exit::Unknown => Err(Error::Unsupported("unknown exit reason")),
        }
    }
}

/// Approximates the original's `access(file, R_OK | X_OK)` check using the
/// host permission bits. Unlike `access(2)` this does not consult the
/// calling process's uid/gid - a privileged caller is still bound by the
/// file's mode bits here - which is an acceptable simplification for a
/// monitor that never runs setuid.
fn check_read_execute_access(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|_| Error::InvalidArgument("executable path is not accessible"))?;
    let mode = metadata.permissions().mode();
    if mode & 0o444 == 0 || mode & 0o111 == 0 {
        return Err(Error::InvalidArgument("executable path lacks read or execute permission"));
    }
    Ok(())
}

impl<B: Backend> Drop for Environment<B> {
    fn drop(&mut self) {
        if let Some(vm) = self.vm.take() {
            self.backend.release_vm(vm);
        }
        self.memory_map.free();
    }
}
