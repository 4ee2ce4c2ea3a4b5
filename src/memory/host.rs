use std::sync::Arc;

use memmap2::{Mmap, MmapMut};

use crate::error::{Error, Result};

const PAGE_SIZE: usize = 4096;

fn round_up_to_page(length: usize) -> usize {
    (length + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1)
}

enum Backing {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Backing {
    fn as_ptr(&self) -> *const u8 {
        match self {
            Backing::ReadOnly(m) => m.as_ptr(),
            Backing::ReadWrite(m) => m.as_ptr(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Backing::ReadOnly(m) => m.len(),
            Backing::ReadWrite(m) => m.len(),
        }
    }
}

struct Inner {
    backing: Backing,
}

/// A page-aligned host mapping shared across every guest region that
/// backs onto it.
///
/// The C original keeps an explicit atomic refcount on this struct: the
/// region's lifetime is the longest of {the caller's own reference,
/// every guest mapping that points at it}. `Arc` already gives us that
/// exact contract (shared ownership, atomic strong count, drop-triggered
/// teardown), so `HostMemoryRegion` is just a cheap, cloneable handle
/// around one. `acquire` is `Clone::clone`; `release` is letting a clone
/// drop. The backing mmap is unmapped when the last clone goes away.
#[derive(Clone)]
pub struct HostMemoryRegion(Arc<Inner>);

impl HostMemoryRegion {
    /// Creates a new shared host mapping.
    ///
    /// `length` is rounded up to a 4 KiB multiple. When `fd` is `None`
    /// the mapping is anonymous; otherwise it is backed by the given
    /// file descriptor's contents (used to project an executable image
    /// directly into guest memory without copying). `host_readonly`
    /// controls whether the *host* side is writable - independent of
    /// whatever access the guest is granted when this region is later
    /// mapped into a `MemoryMap`.
    pub fn allocate(length: usize, host_readonly: bool, fd: Option<&std::fs::File>) -> Result<Self> {
        if length == 0 {
            return Err(Error::InvalidArgument("host memory region length must be non-zero"));
        }

        let length = round_up_to_page(length);

        let backing = match (host_readonly, fd) {
            (true, Some(file)) => {
                // SAFETY: the fd is a regular, caller-owned file; the mapping is
                // dropped (and unmapped) before the fd itself would need to close.
                let mmap = unsafe { Mmap::map(file) }.map_err(|_| Error::OutOfMemory)?;
                Backing::ReadOnly(mmap)
            }
            (true, None) => {
                // No read-only anonymous mapping in memmap2; allocate writable and
                // rely on the caller never observing mutation (only the page-table
                // builder uses anonymous regions, and it always wants them writable).
                let mmap = MmapMut::map_anon(length).map_err(|_| Error::OutOfMemory)?;
                Backing::ReadWrite(mmap)
            }
            (false, Some(file)) => {
                // SAFETY: see above.
                let mmap = unsafe { memmap2::MmapOptions::new().map_mut(file) }
                    .map_err(|_| Error::OutOfMemory)?;
                Backing::ReadWrite(mmap)
            }
            (false, None) => {
                let mmap = MmapMut::map_anon(length).map_err(|_| Error::OutOfMemory)?;
                Backing::ReadWrite(mmap)
            }
        };

        Ok(Self(Arc::new(Inner { backing })))
    }

    /// Convenience wrapper for the common file-backed case: opens `path`
    /// read-only and maps exactly its current size.
    pub fn from_file_readonly(path: &std::path::Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::InvalidArgument("file is empty"));
        }
        Self::allocate(len, true, Some(&file))
    }

    /// Host virtual base address of the mapping.
    pub fn hva(&self) -> *const u8 {
        self.0.backing.as_ptr()
    }

    /// Length in bytes, rounded up to the host page size.
    pub fn len(&self) -> usize {
        self.0.backing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes `data` at `offset` into the mapping. Only valid for
    /// anonymous, host-writable regions such as the page-table pages.
    ///
    /// # Safety
    /// The caller must ensure no other thread concurrently reads or
    /// writes the same bytes; `HostMemoryRegion` otherwise gives no
    /// interior-mutability guarantees, matching the single-threaded
    /// ownership model in which regions are built.
    pub unsafe fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > self.len() {
            return Err(Error::InvalidArgument("write_at out of bounds"));
        }
        // SAFETY: the caller upholds the single-writer invariant documented
        // above; `hva()` points at a live mapping for the lifetime of `self`.
        unsafe {
            let dst = self.hva().add(offset) as *mut u8;
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    /// Number of live references to this host mapping (caller + every
    /// guest mapping currently pointing at it).
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_is_invalid() {
        assert!(matches!(
            HostMemoryRegion::allocate(0, false, None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn anonymous_region_rounds_up_to_page() {
        let region = HostMemoryRegion::allocate(1, false, None).unwrap();
        assert_eq!(region.len(), 4096);
    }

    #[test]
    fn refcount_tracks_clones() {
        let region = HostMemoryRegion::allocate(4096, false, None).unwrap();
        assert_eq!(region.refcount(), 1);
        let second = region.clone();
        assert_eq!(region.refcount(), 2);
        drop(second);
        assert_eq!(region.refcount(), 1);
    }

    #[test]
    fn write_at_round_trips() {
        let region = HostMemoryRegion::allocate(4096, false, None).unwrap();
        let data = [1u8, 2, 3, 4];
        unsafe {
            region.write_at(8, &data).unwrap();
        }
        let read = unsafe { std::slice::from_raw_parts(region.hva().add(8), 4) };
        assert_eq!(read, &data);
    }
}
