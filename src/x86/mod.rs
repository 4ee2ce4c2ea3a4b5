//! Architectural x86-64 CPU state and the long-mode boot-state builder.
//!
//! Field layout mirrors `struct x86_cpu_state` in the original C
//! implementation's `x86.h` closely enough that `backend::kvm` can copy
//! fields 1:1 into/out of `kvm_regs`/`kvm_sregs`.

use bitflags::bitflags;

bitflags! {
    /// Segment descriptor flag bits, laid out the same way the original
    /// `x86_segment::flags` enum does: L, AVL, DB, G, P, S.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SegmentFlags: u8 {
        /// 64-bit code segment (if set, DB must be cleared).
        const L   = 1 << 0;
        /// Available for use by system software.
        const AVL = 1 << 1;
        /// Default operand size (0 = 16-bit, 1 = 32-bit).
        const DB  = 1 << 2;
        /// Granularity (0 = byte blocks, 1 = 4 KiB blocks).
        const G   = 1 << 3;
        /// Segment present.
        const P   = 1 << 4;
        /// Descriptor type (0 = system, 1 = code/data).
        const S   = 1 << 5;
    }
}

/// Segment descriptor type field values used by this monitor.
pub mod seg_type {
    pub const DATA: u8 = 0b0010;
    pub const CODE: u8 = 0b1010;
    pub const TSS32: u8 = 0b1011;
    pub const LDT: u8 = 0b0010;
    pub const ACCESSED: u8 = 1 << 0;
}

/// A single x86 segment descriptor, in the monitor's load/store
/// representation (not the raw 8-byte GDT encoding).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub dpl: u8,
    pub type_: u8,
    pub flags: SegmentFlags,
}

impl Segment {
    /// OR-merges presence/DB/S/L/G/AVL bits read back from the backend
    /// into this segment, per the store-path contract in §4.5: the
    /// backend must never clear flags the caller pre-seeded, only add
    /// ones it observed.
    pub fn merge_from_backend(&mut self, base: u64, limit: u32, selector: u16, dpl: u8, type_: u8, observed: SegmentFlags) {
        self.base = base;
        self.limit = limit;
        self.selector = selector;
        self.dpl = dpl;
        self.type_ = type_;
        self.flags |= observed;
    }
}

/// A descriptor table register (GDTR/IDTR): base + limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u32,
    pub limit: u16,
}

/// Control-register / EFER bit patterns this monitor always sets.
pub mod cr {
    pub const CR0_PE: u32 = 1 << 0;
    pub const CR0_WP: u32 = 1 << 16;
    pub const CR0_PG: u32 = 1 << 31;
    pub const CR0_LONG_MODE: u32 = CR0_PG | CR0_PE | CR0_WP;

    pub const CR4_PAE: u32 = 1 << 5;

    pub const EFER_LME: u32 = 1 << 8;
    pub const EFER_LMA: u32 = 1 << 10;
    pub const EFER_LONG_MODE: u32 = EFER_LME | EFER_LMA;

    pub const RFLAGS_RESERVED: u64 = 0x2;
}

/// Selectors fixed by the boot-state builder (see the segment table in
/// SPEC_FULL.md §4.3).
pub mod selectors {
    pub const CS: u16 = 0x08;
    pub const DATA: u16 = 0x10;
}

/// The full architectural snapshot exchanged with the backend.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct X86CpuState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,

    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub tr: Segment,
    pub ldt: Segment,

    pub gdt: DescriptorTable,
    pub idt: DescriptorTable,

    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub efer: u32,
    pub apic_base: u32,
}

/// Caller-visible general-purpose registers carried across `call`.
///
/// Deliberately excludes RSP: the guest runtime must initialize its own
/// stack, matching the original's `ivee_arch_state_t`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArchState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

fn code_segment() -> Segment {
    Segment {
        base: 0,
        limit: 0xFFFF_FFFF,
        selector: selectors::CS,
        dpl: 0,
        type_: seg_type::CODE | seg_type::ACCESSED,
        flags: SegmentFlags::S | SegmentFlags::P | SegmentFlags::G | SegmentFlags::L,
    }
}

fn data_segment() -> Segment {
    Segment {
        base: 0,
        limit: 0xFFFF_FFFF,
        selector: selectors::DATA,
        dpl: 0,
        type_: seg_type::DATA | seg_type::ACCESSED,
        flags: SegmentFlags::S | SegmentFlags::P | SegmentFlags::G | SegmentFlags::DB,
    }
}

fn system_segment(type_: u8) -> Segment {
    Segment {
        base: 0,
        limit: 0,
        selector: 0,
        dpl: 0,
        type_,
        flags: SegmentFlags::P,
    }
}

/// Builds the initial long-mode CPU snapshot described in SPEC_FULL.md
/// §4.3, merging in the caller's 15 general-purpose registers. RSP and
/// RIP are always forced to 0; RFLAGS always carries only the reserved
/// bit.
pub fn build_boot_state(gprs: &ArchState, pml4_base_gpa: u64) -> X86CpuState {
    X86CpuState {
        rax: gprs.rax,
        rbx: gprs.rbx,
        rcx: gprs.rcx,
        rdx: gprs.rdx,
        rsi: gprs.rsi,
        rdi: gprs.rdi,
        rsp: 0,
        rbp: gprs.rbp,
        r8: gprs.r8,
        r9: gprs.r9,
        r10: gprs.r10,
        r11: gprs.r11,
        r12: gprs.r12,
        r13: gprs.r13,
        r14: gprs.r14,
        r15: gprs.r15,
        rip: 0,
        rflags: cr::RFLAGS_RESERVED,

        cs: code_segment(),
        ds: data_segment(),
        es: data_segment(),
        fs: data_segment(),
        gs: data_segment(),
        ss: data_segment(),
        tr: system_segment(seg_type::TSS32),
        ldt: system_segment(seg_type::LDT),

        // Zero-limit GDT/IDT is intentional: it forces a triple-fault on
        // any guest exception, the supported failure mode until the
        // guest installs its own tables.
        gdt: DescriptorTable { base: 0, limit: 0 },
        idt: DescriptorTable { base: 0, limit: 0 },

        cr0: cr::CR0_LONG_MODE,
        cr2: 0,
        cr3: pml4_base_gpa as u32,
        cr4: cr::CR4_PAE,
        efer: cr::EFER_LONG_MODE,
        apic_base: 0,
    }
}

impl X86CpuState {
    /// Extracts the 15 caller-visible GPRs (everything but RSP).
    pub fn to_arch_state(&self) -> ArchState {
        ArchState {
            rax: self.rax,
            rbx: self.rbx,
            rcx: self.rcx,
            rdx: self.rdx,
            rsi: self.rsi,
            rdi: self.rdi,
            rbp: self.rbp,
            r8: self.r8,
            r9: self.r9,
            r10: self.r10,
            r11: self.r11,
            r12: self.r12,
            r13: self.r13,
            r14: self.r14,
            r15: self.r15,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_state_forces_rsp_rip_and_rflags() {
        let gprs = ArchState { rax: 1, rcx: 2, ..Default::default() };
        let state = build_boot_state(&gprs, 0xFFFF_F000);
        assert_eq!(state.rsp, 0);
        assert_eq!(state.rip, 0);
        assert_eq!(state.rflags, cr::RFLAGS_RESERVED);
        assert_eq!(state.rax, 1);
        assert_eq!(state.rcx, 2);
        assert_eq!(state.cr3, 0xFFFF_F000);
    }

    #[test]
    fn long_mode_control_registers_match_spec_bit_patterns() {
        let state = build_boot_state(&ArchState::default(), 0);
        assert_eq!(state.cr0, 0x8001_0001);
        assert_eq!(state.cr4, 0x20);
        assert_eq!(state.efer, 0x500);
    }

    #[test]
    fn segment_table_matches_spec() {
        let state = build_boot_state(&ArchState::default(), 0);
        assert_eq!(state.cs.selector, 0x08);
        assert_eq!(state.cs.limit, 0xFFFF_FFFF);
        assert!(state.cs.flags.contains(SegmentFlags::L));
        assert!(!state.cs.flags.contains(SegmentFlags::DB));

        assert_eq!(state.ds.selector, 0x10);
        assert!(state.ds.flags.contains(SegmentFlags::DB));
        assert!(!state.ds.flags.contains(SegmentFlags::L));

        assert_eq!(state.gdt.limit, 0);
        assert_eq!(state.idt.limit, 0);
    }

    #[test]
    fn store_path_only_adds_flags_never_clears() {
        let mut seg = Segment {
            flags: SegmentFlags::AVL,
            ..Default::default()
        };
        seg.merge_from_backend(0, 0, 0, 0, 0, SegmentFlags::P);
        assert!(seg.flags.contains(SegmentFlags::AVL));
        assert!(seg.flags.contains(SegmentFlags::P));
    }

    #[test]
    fn arch_state_round_trips_through_cpu_state() {
        let gprs = ArchState {
            rax: 0xDEAD,
            r15: 0xBEEF,
            ..Default::default()
        };
        let state = build_boot_state(&gprs, 0);
        assert_eq!(state.to_arch_state(), gprs);
    }
}
