//! ivee - isolated execution environment library.
//!
//! A small user-space monitor that creates a single-vCPU virtual machine
//! through an abstract [`backend::Backend`], loads a flat binary image
//! into guest physical memory, boots the guest directly into 64-bit long
//! mode with an identity-mapped page table, and exposes a synchronous
//! [`monitor::Environment::call`] primitive that returns when the guest
//! signals completion on [`monitor::TERMINATE_PORT`].
//!
//! ```no_run
//! use ivee::{backend::KvmBackend, ArchState, Environment, ExecutableFormat};
//!
//! # fn main() -> ivee::Result<()> {
//! let mut env = Environment::create(0, KvmBackend::new())?;
//! env.load_executable("guest.bin".as_ref(), ExecutableFormat::Bin)?;
//!
//! let mut state = ArchState { rcx: 0xDEADF00D, rdx: 0xCAFEBABE, ..Default::default() };
//! env.call(&mut state)?;
//! println!("guest returned rax = {:#x}", state.rax);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod capabilities;
#[cfg(feature = "capi")]
pub mod capi;
pub mod error;
pub mod format;
pub mod memory;
pub mod monitor;
pub mod pagetable;
pub mod x86;

pub use capabilities::Capabilities;
pub use error::{Error, Result};
pub use format::ExecutableFormat;
pub use monitor::Environment;
pub use x86::ArchState;

/// Bit-set of platform capabilities this implementation actually
/// supports (currently none).
pub fn list_platform_capabilities() -> u64 {
    Capabilities::supported().bits()
}
