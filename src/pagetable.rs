//! Identity-map page-table builder (SPEC_FULL.md §4.4).
//!
//! Writes 515 contiguous 4 KiB pages mapping the first 1 GiB of guest
//! physical address space 1:1, placed immediately below the 4 GiB line so
//! the executable image at GPA 0 and any RAM in between fall inside the
//! mapped window. Constants and the PDPT `|0x1` vs `|0x3` asymmetry are
//! taken bit-for-bit from `original_source/src/libivee.c::
//! init_guest_page_table`.

use crate::error::Result;
use crate::memory::HostMemoryRegion;

const PAGE_SIZE: u64 = 0x1000;
const PTES_PER_PAGE: u64 = PAGE_SIZE / 8;
const PT_PAGE_COUNT: u64 = 515;

pub const PAGE_TABLE_SIZE: u64 = PAGE_SIZE * PT_PAGE_COUNT;
pub const PML4_BASE_GPA: u64 = 0x1_0000_0000 - PAGE_TABLE_SIZE;
pub const PDPT_BASE_GPA: u64 = PML4_BASE_GPA + PAGE_SIZE;
pub const PD_BASE_GPA: u64 = PDPT_BASE_GPA + PAGE_SIZE;
pub const PT_BASE_GPA: u64 = PD_BASE_GPA + PAGE_SIZE;

const PTE_PRESENT: u64 = 1 << 0;
const PTE_RW: u64 = 1 << 1;

/// Builds a fresh, anonymous, host-writable region containing the 515
/// page-table pages, with entries filled in per SPEC_FULL.md §4.4.
///
/// The caller is expected to map the returned region into the guest
/// memory map at [`PML4_BASE_GPA`] as guest-read-only, then drop its own
/// reference (the memory map keeps the region alive).
pub fn build_identity_page_tables() -> Result<HostMemoryRegion> {
    let region = HostMemoryRegion::allocate(PAGE_TABLE_SIZE as usize, false, None)?;

    // PML4[0] -> PDPT, present + writable.
    write_entry(&region, 0, PDPT_BASE_GPA | PTE_PRESENT | PTE_RW)?;

    // PDPT[0] -> PD. Present but *not* writable: preserved bit-for-bit per
    // the Open Question in SPEC_FULL.md §4.4 - the PT entries below are
    // what ultimately govern effective access.
    write_entry(&region, PAGE_SIZE, PD_BASE_GPA | PTE_PRESENT)?;

    // PD[i] -> PT page i, for all 512 PT pages.
    for i in 0..512u64 {
        let offset = 2 * PAGE_SIZE + i * 8;
        let value = (PT_BASE_GPA + i * PAGE_SIZE) | PTE_PRESENT | PTE_RW;
        write_entry(&region, offset, value)?;
    }

    // PT[j] identity-maps guest frame j, for all 2^18 4 KiB frames in the
    // first 1 GiB.
    for j in 0..(1u64 << 18) {
        let offset = 3 * PAGE_SIZE + j * 8;
        let value = (j * PAGE_SIZE) | PTE_PRESENT | PTE_RW;
        write_entry(&region, offset, value)?;
    }

    Ok(region)
}

fn write_entry(region: &HostMemoryRegion, offset: u64, value: u64) -> Result<()> {
    // SAFETY: `region` was just allocated by us, is anonymous and
    // host-writable, and no other reference to it exists yet.
    unsafe { region.write_at(offset as usize, &value.to_le_bytes()) }
}

#[cfg(test)]
fn read_entry(region: &HostMemoryRegion, offset: u64) -> u64 {
    let ptr = region.hva();
    // SAFETY: offset is always within the region built above.
    unsafe {
        let bytes = std::slice::from_raw_parts(ptr.add(offset as usize), 8);
        u64::from_le_bytes(bytes.try_into().unwrap())
    }
}
