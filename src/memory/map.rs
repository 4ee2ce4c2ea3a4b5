use crate::error::{Error, Result};
use crate::memory::host::HostMemoryRegion;

/// Guest frame number: a guest physical address shifted right by 12.
pub type Gfn = u64;

const PAGE_SHIFT: u32 = 12;
const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

bitflags::bitflags! {
    /// Guest-visible access flags. The backend only ever honors RO vs RW
    /// (see `MemoryMap::regions` / `GuestMemoryRegion::guest_readonly`);
    /// EXEC is tracked for completeness with the original's `enum
    /// ivee_memory_prot` but has no backend-level effect in this system.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GuestProt: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

/// One guest-physical region, backed by a (possibly shared) host mapping.
#[derive(Clone)]
pub struct GuestMemoryRegion {
    pub first_gfn: Gfn,
    pub last_gfn: Gfn,
    pub prot: GuestProt,
    pub host: HostMemoryRegion,
}

impl GuestMemoryRegion {
    pub fn guest_readonly(&self) -> bool {
        !self.prot.contains(GuestProt::WRITE)
    }

    fn overlaps(&self, first_gfn: Gfn, last_gfn: Gfn) -> bool {
        first_gfn <= self.last_gfn && last_gfn >= self.first_gfn
    }
}

/// An ordered, overlap-free set of guest memory regions.
///
/// Only ever grows to two regions in this system (the executable image
/// at GPA 0 and the identity page tables near the 4 GiB boundary), so no
/// adjacency-merging is implemented - the backend doesn't need it, and
/// neither caller ever produces adjacent regions.
#[derive(Default)]
pub struct MemoryMap {
    regions: Vec<GuestMemoryRegion>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self { regions: Vec::new() }
    }

    pub fn regions(&self) -> &[GuestMemoryRegion] {
        &self.regions
    }

    /// Maps `host` into the guest address space starting at `gpa`.
    ///
    /// Rejects a `gpa`/length combination that would overflow the 64-bit
    /// GPA space, and rejects any overlap with an existing region.
    /// Acquires a reference on `host` on success (the caller's own
    /// reference is unaffected - dropping the `HostMemoryRegion` passed in
    /// still leaves the map's clone alive).
    pub fn map_region(&mut self, host: &HostMemoryRegion, gpa: u64, prot: GuestProt) -> Result<()> {
        let length = host.len() as u64;
        if length == 0 {
            return Err(Error::InvalidArgument("cannot map a zero-length host region"));
        }

        // gpa + length - 1 must not overflow u64.
        if gpa.checked_add(length - 1).is_none() {
            return Err(Error::InvalidArgument("guest region overflows the GPA address space"));
        }

        let first_gfn = gpa >> PAGE_SHIFT;
        let last_gfn = (gpa + (length - 1)) >> PAGE_SHIFT;

        if self.regions.iter().any(|r| r.overlaps(first_gfn, last_gfn)) {
            return Err(Error::InvalidArgument("guest region overlaps an existing mapping"));
        }

        self.regions.push(GuestMemoryRegion {
            first_gfn,
            last_gfn,
            prot,
            host: host.clone(),
        });

        Ok(())
    }

    /// Drops every region, releasing the map's reference on each backing
    /// host region.
    pub fn free(&mut self) {
        self.regions.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }
}

pub fn gpa_of(gfn: Gfn) -> u64 {
    gfn * PAGE_SIZE
}
