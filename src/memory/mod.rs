pub mod host;
pub mod map;

pub use host::HostMemoryRegion;
pub use map::{gpa_of, Gfn, GuestMemoryRegion, GuestProt, MemoryMap};
