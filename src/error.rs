use thiserror::Error as ThisError;

/// The error taxonomy shared by every public entry point.
///
/// These are kinds, not exception classes: an operation either fully
/// succeeds or returns exactly one of these and leaves its outputs
/// untouched.
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("out of memory")]
    OutOfMemory,

    #[error("no space left in memory map / backend slot table")]
    NoSpace,

    #[error("hypervisor backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend error: {0}")]
    BackendError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::BackendError(e.to_string())
    }
}

impl From<kvm_ioctls::Error> for Error {
    fn from(e: kvm_ioctls::Error) -> Self {
        Error::BackendError(e.to_string())
    }
}

impl Error {
    /// Sign-encoded errno-style representation used by the `capi` FFI
    /// surface: negative = error kind, never zero.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => -libc_einval(),
            Error::Unsupported(_) => -libc_enotsup(),
            Error::OutOfMemory => -libc_enomem(),
            Error::NoSpace => -libc_enospc(),
            Error::BackendUnavailable(_) => -libc_enxio(),
            Error::BackendError(_) => -libc_eio(),
        }
    }
}

// Small, dependency-free stand-ins for the handful of errno values the
// capi layer needs to reproduce. Avoids pulling in `libc` for five
// constants that never change across the platforms this crate targets.
const fn libc_einval() -> i32 {
    22
}
const fn libc_enomem() -> i32 {
    12
}
const fn libc_enospc() -> i32 {
    28
}
const fn libc_enxio() -> i32 {
    6
}
const fn libc_eio() -> i32 {
    5
}
const fn libc_enotsup() -> i32 {
    95
}
