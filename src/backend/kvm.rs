//! Production hypervisor backend, driving the host kernel's KVM device.
//!
//! Grounded on `src/vm/mod.rs` in the teacher for VM/vCPU/memory-slot
//! setup shape, on `original_source/src/kvm.c` for the exact
//! slot-bookkeeping strategy (`ivee_set_kvm_memory_map` deletes every
//! in-use slot before recreating the table from scratch) and the
//! load/store field lists, and on the `VcpuExit::IoOut`/`IoIn` exit
//! translation used throughout the rust-vmm ecosystem (see
//! `other_examples/.../virt-do-lumper__src-vmm-src-cpu-mod.rs`).

use std::sync::OnceLock;

use kvm_bindings::{kvm_dtable, kvm_regs, kvm_segment, kvm_sregs, kvm_userspace_memory_region, KVM_MEM_READONLY};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};

use crate::backend::{Backend, Exit, IoDirection};
use crate::error::{Error, Result};
use crate::memory::MemoryMap;
use crate::x86::{DescriptorTable, Segment, SegmentFlags, X86CpuState};

const MIN_KVM_API_VERSION: i32 = 12;
pub const MAX_MEMORY_SLOTS: usize = 16;
const APIC_ID: u64 = 0;

static KVM_DEVICE: OnceLock<Kvm> = OnceLock::new();

fn kvm_device() -> Result<&'static Kvm> {
    if let Some(kvm) = KVM_DEVICE.get() {
        return Ok(kvm);
    }
    let kvm = Kvm::new().map_err(|e| Error::BackendUnavailable(e.to_string()))?;
    Ok(KVM_DEVICE.get_or_init(|| kvm))
}

#[derive(Default)]
struct Slot {
    is_used: bool,
    is_ro: bool,
    first_gpa: u64,
    last_gpa: u64,
    hva: u64,
}

/// Opaque per-environment KVM handle: one VM, one vCPU, and the slot
/// table the monitor's memory map gets flattened into.
pub struct KvmVm {
    _vm: VmFd,
    vcpu: VcpuFd,
    slots: [Slot; MAX_MEMORY_SLOTS],
}

pub struct KvmBackend;

impl KvmBackend {
    pub fn new() -> Self {
        KvmBackend
    }
}

impl Default for KvmBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for KvmBackend {
    type Vm = KvmVm;

    fn probe() -> Result<()> {
        let kvm = kvm_device()?;
        if kvm.get_api_version() < MIN_KVM_API_VERSION {
            return Err(Error::BackendUnavailable("host KVM API version too old".into()));
        }
        if kvm.get_nr_memslots() < MAX_MEMORY_SLOTS {
            return Err(Error::BackendUnavailable("host KVM does not support enough memory slots".into()));
        }
        Ok(())
    }

    fn create_vm(&self) -> Result<KvmVm> {
        let kvm = kvm_device()?;
        let vm = kvm.create_vm().map_err(|e| Error::BackendError(e.to_string()))?;
        let vcpu = vm.create_vcpu(APIC_ID).map_err(|e| Error::BackendError(e.to_string()))?;

        Ok(KvmVm {
            _vm: vm,
            vcpu,
            slots: Default::default(),
        })
    }

    fn release_vm(&self, _vm: KvmVm) {
        // VmFd/VcpuFd close their descriptors on drop; nothing else to do.
        // Safe to call on a partially-initialized handle because every
        // field here is itself drop-safe in isolation.
    }

    fn install_memory_map(&self, vm: &mut KvmVm, map: &MemoryMap) -> Result<()> {
        // Blindly resetting every slot is expensive in KVM, but memory maps
        // in this system change at most once per environment (load time),
        // so reconstructing the whole table from scratch is simplest and
        // matches `ivee_set_kvm_memory_map` in the original.
        for index in 0..MAX_MEMORY_SLOTS {
            if !vm.slots[index].is_used {
                continue;
            }
            delete_slot(&vm._vm, index)?;
            vm.slots[index].is_used = false;
        }

        let regions = map.regions();
        if regions.len() > MAX_MEMORY_SLOTS {
            return Err(Error::NoSpace);
        }

        for (index, region) in regions.iter().enumerate() {
            let first_gpa = region.first_gfn << 12;
            let last_gpa = ((region.last_gfn + 1) << 12) - 1;
            let is_ro = region.guest_readonly();
            let hva = region.host.hva() as u64;

            set_slot(&vm._vm, index, first_gpa, last_gpa, hva, is_ro)?;

            vm.slots[index] = Slot {
                is_used: true,
                is_ro,
                first_gpa,
                last_gpa,
                hva,
            };
        }

        Ok(())
    }

    fn load_vcpu_state(&self, vm: &mut KvmVm, state: &X86CpuState) -> Result<()> {
        let regs = kvm_regs {
            rax: state.rax,
            rbx: state.rbx,
            rcx: state.rcx,
            rdx: state.rdx,
            rsi: state.rsi,
            rdi: state.rdi,
            rsp: state.rsp,
            rbp: state.rbp,
            r8: state.r8,
            r9: state.r9,
            r10: state.r10,
            r11: state.r11,
            r12: state.r12,
            r13: state.r13,
            r14: state.r14,
            r15: state.r15,
            rip: state.rip,
            rflags: state.rflags,
        };
        vm.vcpu.set_regs(&regs).map_err(|e| Error::BackendError(e.to_string()))?;

        let mut sregs: kvm_sregs = Default::default();
        load_segment(&mut sregs.cs, &state.cs);
        load_segment(&mut sregs.ds, &state.ds);
        load_segment(&mut sregs.es, &state.es);
        load_segment(&mut sregs.fs, &state.fs);
        load_segment(&mut sregs.gs, &state.gs);
        load_segment(&mut sregs.ss, &state.ss);
        load_segment(&mut sregs.tr, &state.tr);
        load_segment(&mut sregs.ldt, &state.ldt);
        load_dtable(&mut sregs.gdt, &state.gdt);
        load_dtable(&mut sregs.idt, &state.idt);
        sregs.cr0 = state.cr0 as u64;
        sregs.cr2 = state.cr2 as u64;
        sregs.cr3 = state.cr3 as u64;
        sregs.cr4 = state.cr4 as u64;
        sregs.efer = state.efer as u64;
        sregs.apic_base = state.apic_base as u64;

        vm.vcpu.set_sregs(&sregs).map_err(|e| Error::BackendError(e.to_string()))?;
        Ok(())
    }

    fn store_vcpu_state(&self, vm: &KvmVm, state: &mut X86CpuState) -> Result<()> {
        let regs = vm.vcpu.get_regs().map_err(|e| Error::BackendError(e.to_string()))?;
        state.rax = regs.rax;
        state.rbx = regs.rbx;
        state.rcx = regs.rcx;
        state.rdx = regs.rdx;
        state.rsi = regs.rsi;
        state.rdi = regs.rdi;
        state.rsp = regs.rsp;
        state.rbp = regs.rbp;
        state.r8 = regs.r8;
        state.r9 = regs.r9;
        state.r10 = regs.r10;
        state.r11 = regs.r11;
        state.r12 = regs.r12;
        state.r13 = regs.r13;
        state.r14 = regs.r14;
        state.r15 = regs.r15;
        state.rip = regs.rip;
        state.rflags = regs.rflags;

        let sregs = vm.vcpu.get_sregs().map_err(|e| Error::BackendError(e.to_string()))?;
        store_segment(&sregs.cs, &mut state.cs);
        store_segment(&sregs.ds, &mut state.ds);
        store_segment(&sregs.es, &mut state.es);
        store_segment(&sregs.fs, &mut state.fs);
        store_segment(&sregs.gs, &mut state.gs);
        store_segment(&sregs.ss, &mut state.ss);
        store_segment(&sregs.tr, &mut state.tr);
        store_segment(&sregs.ldt, &mut state.ldt);
        state.cr0 = sregs.cr0 as u32;
        state.cr2 = sregs.cr2 as u32;
        state.cr3 = sregs.cr3 as u32;
        state.cr4 = sregs.cr4 as u32;
        state.efer = sregs.efer as u32;
        state.apic_base = sregs.apic_base as u32;

        Ok(())
    }

    fn run(&self, vm: &mut KvmVm) -> Result<Exit> {
        match vm.vcpu.run() {
            Ok(VcpuExit::IoOut(port, data)) => Ok(Exit::Io {
                port,
                size: data.len() as u8,
                direction: IoDirection::Out,
                data: zero_padded(data),
            }),
            Ok(VcpuExit::IoIn(port, data)) => Ok(Exit::Io {
                port,
                size: data.len() as u8,
                direction: IoDirection::In,
                data: zero_padded(data),
            }),
            Ok(_other) => Ok(Exit::Unknown),
            Err(e) => Err(Error::BackendError(e.to_string())),
        }
    }
}

fn zero_padded(data: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    let n = data.len().min(4);
    buf[..n].copy_from_slice(&data[..n]);
    u32::from_le_bytes(buf)
}

fn set_slot(vm: &VmFd, index: usize, first_gpa: u64, last_gpa: u64, hva: u64, is_ro: bool) -> Result<()> {
    let region = kvm_userspace_memory_region {
        slot: index as u32,
        flags: if is_ro { KVM_MEM_READONLY } else { 0 },
        guest_phys_addr: first_gpa,
        memory_size: last_gpa - first_gpa + 1,
        userspace_addr: hva,
    };
    // SAFETY: `hva` points at a live host mapping for as long as the
    // memory map keeps its `HostMemoryRegion` reference alive, which
    // outlives this VM's use of the slot.
    unsafe { vm.set_user_memory_region(region) }.map_err(|e| Error::BackendError(e.to_string()))?;
    Ok(())
}

fn delete_slot(vm: &VmFd, index: usize) -> Result<()> {
    let region = kvm_userspace_memory_region {
        slot: index as u32,
        flags: 0,
        guest_phys_addr: 0,
        memory_size: 0,
        userspace_addr: 0,
    };
    // SAFETY: a zero-sized region unconditionally removes the slot.
    unsafe { vm.set_user_memory_region(region) }.map_err(|e| Error::BackendError(e.to_string()))?;
    Ok(())
}

fn load_segment(kvmseg: &mut kvm_segment, seg: &Segment) {
    kvmseg.base = seg.base;
    kvmseg.limit = seg.limit;
    kvmseg.selector = seg.selector;
    kvmseg.type_ = seg.type_;
    kvmseg.dpl = seg.dpl;
    kvmseg.present = seg.flags.contains(SegmentFlags::P) as u8;
    kvmseg.db = seg.flags.contains(SegmentFlags::DB) as u8;
    kvmseg.s = seg.flags.contains(SegmentFlags::S) as u8;
    kvmseg.l = seg.flags.contains(SegmentFlags::L) as u8;
    kvmseg.g = seg.flags.contains(SegmentFlags::G) as u8;
    kvmseg.avl = seg.flags.contains(SegmentFlags::AVL) as u8;
    kvmseg.unusable = (kvmseg.present == 0) as u8;
}

fn store_segment(kvmseg: &kvm_segment, seg: &mut Segment) {
    let mut observed = SegmentFlags::empty();
    observed.set(SegmentFlags::P, kvmseg.present != 0);
    observed.set(SegmentFlags::DB, kvmseg.db != 0);
    observed.set(SegmentFlags::S, kvmseg.s != 0);
    observed.set(SegmentFlags::L, kvmseg.l != 0);
    observed.set(SegmentFlags::G, kvmseg.g != 0);
    observed.set(SegmentFlags::AVL, kvmseg.avl != 0);

    seg.merge_from_backend(kvmseg.base, kvmseg.limit, kvmseg.selector, kvmseg.dpl, kvmseg.type_, observed);
}

fn load_dtable(kvm_dtable: &mut kvm_dtable, dtable: &DescriptorTable) {
    kvm_dtable.base = dtable.base as u64;
    kvm_dtable.limit = dtable.limit;
    kvm_dtable.padding = Default::default();
}
