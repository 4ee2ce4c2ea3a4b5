//! Opt-in `extern "C"` ABI matching `libivee.h` from the original C
//! implementation exactly: function names, the sign-encoded integer
//! return convention, and the `ivee_arch_state_t` field layout. Gated
//! behind the `capi` feature so the default library build stays a plain
//! safe Rust crate; only enabled when embedding this crate into a C
//! caller that expects the original ABI unchanged.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::path::Path;

use crate::backend::KvmBackend;
use crate::error::Error;
use crate::format::ExecutableFormat;
use crate::monitor::Environment;
use crate::x86::ArchState;

/// Opaque handle matching `ivee_t*` in the C header.
pub struct Ivee(Environment<KvmBackend>);

/// Matches `ivee_arch_state_t` field-for-field.
#[repr(C)]
pub struct IveeArchState {
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

impl From<&IveeArchState> for ArchState {
    fn from(s: &IveeArchState) -> Self {
        ArchState {
            rax: s.rax,
            rbx: s.rbx,
            rcx: s.rcx,
            rdx: s.rdx,
            rsi: s.rsi,
            rdi: s.rdi,
            rbp: s.rbp,
            r8: s.r8,
            r9: s.r9,
            r10: s.r10,
            r11: s.r11,
            r12: s.r12,
            r13: s.r13,
            r14: s.r14,
            r15: s.r15,
        }
    }
}

fn write_back(dst: &mut IveeArchState, src: &ArchState) {
    dst.rax = src.rax;
    dst.rbx = src.rbx;
    dst.rcx = src.rcx;
    dst.rdx = src.rdx;
    dst.rsi = src.rsi;
    dst.rdi = src.rdi;
    dst.rbp = src.rbp;
    dst.r8 = src.r8;
    dst.r9 = src.r9;
    dst.r10 = src.r10;
    dst.r11 = src.r11;
    dst.r12 = src.r12;
    dst.r13 = src.r13;
    dst.r14 = src.r14;
    dst.r15 = src.r15;
}

/// `uint64_t ivee_list_platform_capabilities(void)`
#[no_mangle]
pub extern "C" fn ivee_list_platform_capabilities() -> u64 {
    crate::list_platform_capabilities()
}

/// `int ivee_create(ivee_capabilities_t caps, ivee_t** ivee)`
///
/// # Safety
/// `out_ivee` must be a valid, non-null pointer to a writable `*mut Ivee`.
#[no_mangle]
pub unsafe extern "C" fn ivee_create(caps: u64, out_ivee: *mut *mut Ivee) -> i32 {
    if out_ivee.is_null() {
        return Error::InvalidArgument("out_ivee must not be null").to_errno();
    }

    match Environment::create(caps, KvmBackend::new()) {
        Ok(env) => {
            let boxed = Box::new(Ivee(env));
            // SAFETY: caller guarantees `out_ivee` is a valid write target.
            unsafe { *out_ivee = Box::into_raw(boxed) };
            0
        }
        Err(e) => e.to_errno(),
    }
}

/// `void ivee_destroy(ivee_t* ivee)`
///
/// # Safety
/// `ivee` must be a pointer previously returned by `ivee_create` and not
/// already destroyed, or null (a no-op).
#[no_mangle]
pub unsafe extern "C" fn ivee_destroy(ivee: *mut Ivee) {
    if ivee.is_null() {
        return;
    }
    // SAFETY: caller guarantees `ivee` came from `ivee_create` and is not
    // aliased elsewhere.
    unsafe { drop(Box::from_raw(ivee)) };
}

/// `int ivee_load_executable(ivee_t* ivee, const char* file, ivee_executable_format_t format)`
///
/// # Safety
/// `ivee` must be a live handle from `ivee_create`; `file` must be a
/// valid, NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn ivee_load_executable(ivee: *mut Ivee, file: *const c_char, format: i32) -> i32 {
    if ivee.is_null() || file.is_null() {
        return Error::InvalidArgument("ivee and file must not be null").to_errno();
    }

    let format = match format {
        0 => ExecutableFormat::Bin,
        1 => ExecutableFormat::Any,
        _ => return Error::Unsupported("unknown executable format").to_errno(),
    };

    // SAFETY: caller guarantees `file` is a valid NUL-terminated string.
    let path_str = match unsafe { CStr::from_ptr(file) }.to_str() {
        Ok(s) => s,
        Err(_) => return Error::InvalidArgument("file path is not valid UTF-8").to_errno(),
    };

    // SAFETY: caller guarantees `ivee` is a live handle.
    let env = unsafe { &mut (*ivee).0 };
    match env.load_executable(Path::new(path_str), format) {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

/// `int ivee_call(ivee_t* ivee, ivee_arch_state_t* state)`
///
/// # Safety
/// `ivee` must be a live handle from `ivee_create`; `state` must point at
/// a valid, writable `IveeArchState`.
#[no_mangle]
pub unsafe extern "C" fn ivee_call(ivee: *mut Ivee, state: *mut IveeArchState) -> i32 {
    if ivee.is_null() || state.is_null() {
        return Error::InvalidArgument("ivee and state must not be null").to_errno();
    }

    // SAFETY: caller guarantees both pointers are live and non-aliased.
    let env = unsafe { &mut (*ivee).0 };
    let c_state = unsafe { &mut *state };

    let mut arch_state: ArchState = (&*c_state).into();
    match env.call(&mut arch_state) {
        Ok(()) => {
            write_back(c_state, &arch_state);
            0
        }
        Err(e) => e.to_errno(),
    }
}
