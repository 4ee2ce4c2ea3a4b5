//! In-process scripted backend for privilege-free tests.
//!
//! Real guest code never runs here: `StubVm` just records the state the
//! monitor loads, and replays a pre-scripted sequence of `Exit`s back to
//! it, so `crate::monitor`'s call loop can be exercised without `/dev/kvm`.

use std::cell::RefCell;
use std::collections::VecDeque;

use crate::backend::{Backend, Exit};
use crate::error::{Error, Result};
use crate::memory::MemoryMap;
use crate::x86::X86CpuState;

/// One region installed via `install_memory_map`, kept only for
/// introspection in tests.
#[derive(Clone)]
pub struct InstalledRegion {
    pub first_gfn: u64,
    pub last_gfn: u64,
    pub readonly: bool,
}

pub struct StubVm {
    pub loaded_state: Option<X86CpuState>,
    pub installed_regions: Vec<InstalledRegion>,
    exits: RefCell<VecDeque<Exit>>,
}

/// A backend that never touches the host kernel. Construct it with the
/// exact sequence of exits `run` should hand back, one per call; once
/// the script is exhausted, `run` returns `Error::BackendError`.
pub struct StubBackend {
    script: RefCell<VecDeque<Exit>>,
    effect: Option<Box<dyn Fn(&mut X86CpuState)>>,
}

impl StubBackend {
    pub fn new(script: Vec<Exit>) -> Self {
        StubBackend {
            script: RefCell::new(script.into()),
            effect: None,
        }
    }

    /// Like [`StubBackend::new`], but `effect` is applied to the loaded
    /// CPU state on every `run` call before the scripted exit is handed
    /// back - a stand-in for "the guest executed some instructions",
    /// since this backend never actually runs guest code.
    pub fn with_effect(script: Vec<Exit>, effect: impl Fn(&mut X86CpuState) + 'static) -> Self {
        StubBackend {
            script: RefCell::new(script.into()),
            effect: Some(Box::new(effect)),
        }
    }

    /// A backend whose first `run` call always reports `Exit::Unknown`
    /// (matching a guest that triple-faults or halts with no I/O).
    pub fn unknown_exit() -> Self {
        Self::new(vec![Exit::Unknown])
    }
}

impl Backend for StubBackend {
    type Vm = StubVm;

    fn probe() -> Result<()> {
        Ok(())
    }

    fn create_vm(&self) -> Result<StubVm> {
        Ok(StubVm {
            loaded_state: None,
            installed_regions: Vec::new(),
            exits: RefCell::new(self.script.borrow().clone()),
        })
    }

    fn release_vm(&self, _vm: StubVm) {}

    fn install_memory_map(&self, vm: &mut StubVm, map: &MemoryMap) -> Result<()> {
        vm.installed_regions = map
            .regions()
            .iter()
            .map(|r| InstalledRegion {
                first_gfn: r.first_gfn,
                last_gfn: r.last_gfn,
                readonly: r.guest_readonly(),
            })
            .collect();
        Ok(())
    }

    fn load_vcpu_state(&self, vm: &mut StubVm, state: &X86CpuState) -> Result<()> {
        vm.loaded_state = Some(state.clone());
        Ok(())
    }

    fn store_vcpu_state(&self, vm: &StubVm, state: &mut X86CpuState) -> Result<()> {
        if let Some(loaded) = &vm.loaded_state {
            *state = loaded.clone();
        }
        Ok(())
    }

    fn run(&self, vm: &mut StubVm) -> Result<Exit> {
        if let Some(effect) = &self.effect {
            if let Some(state) = vm.loaded_state.as_mut() {
                effect(state);
            }
        }
        vm.exits
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| Error::BackendError("stub script exhausted".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::IoDirection;
    use crate::memory::{GuestProt, HostMemoryRegion};

    #[test]
    fn replays_scripted_exits_in_order() {
        let backend = StubBackend::new(vec![
            Exit::Io {
                port: 0x78,
                size: 4,
                direction: IoDirection::Out,
                data: 1,
            },
            Exit::Unknown,
        ]);
        let mut vm = backend.create_vm().unwrap();
        assert!(matches!(backend.run(&mut vm).unwrap(), Exit::Io { port: 0x78, .. }));
        assert!(matches!(backend.run(&mut vm).unwrap(), Exit::Unknown));
        assert!(backend.run(&mut vm).is_err());
    }

    #[test]
    fn records_installed_regions() {
        let backend = StubBackend::new(vec![]);
        let mut vm = backend.create_vm().unwrap();
        let host = HostMemoryRegion::allocate(4096, false, None).unwrap();
        let mut map = MemoryMap::new();
        map.map_region(&host, 0, GuestProt::READ).unwrap();
        backend.install_memory_map(&mut vm, &map).unwrap();
        assert_eq!(vm.installed_regions.len(), 1);
        assert!(vm.installed_regions[0].readonly);
    }

    #[test]
    fn effect_mutates_loaded_state_before_exit() {
        let backend = StubBackend::with_effect(
            vec![Exit::Io {
                port: 0x78,
                size: 4,
                direction: IoDirection::Out,
                data: 0,
            }],
            |state| state.rax = state.rcx + state.rdx,
        );
        let mut vm = backend.create_vm().unwrap();
        let mut state = X86CpuState { rcx: 2, rdx: 3, ..Default::default() };
        backend.load_vcpu_state(&mut vm, &state).unwrap();
        backend.run(&mut vm).unwrap();
        backend.store_vcpu_state(&vm, &mut state).unwrap();
        assert_eq!(state.rax, 5);
    }

    #[test]
    fn store_reflects_last_loaded_state() {
        let backend = StubBackend::new(vec![]);
        let mut vm = backend.create_vm().unwrap();
        let mut state = X86CpuState::default();
        state.rax = 42;
        backend.load_vcpu_state(&mut vm, &state).unwrap();

        let mut readback = X86CpuState::default();
        backend.store_vcpu_state(&vm, &mut readback).unwrap();
        assert_eq!(readback.rax, 42);
    }
}
