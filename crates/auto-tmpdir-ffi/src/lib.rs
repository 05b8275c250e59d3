//! C ABI for auto-tmpdir
//!
//! Lets a scheduler plugin written in C drive the directory lifecycle for one
//! job step. The handle owns its configuration and any bind mounts it made.
//!
//! # Example (C)
//! ```c
//! #include <auto_tmpdir.h>
//!
//! AutoTmpdirHandle *h = auto_tmpdir_open(job_id, step_id, task_id, uid, gid, config_json);
//! if (h == NULL || auto_tmpdir_provision(h) != AUTO_TMPDIR_STATUS_OK) {
//!     fprintf(stderr, "auto_tmpdir: %s\n", auto_tmpdir_last_error());
//! }
//! setenv("TMPDIR", auto_tmpdir_tmpdir(h), 1);
//! /* ... job runs ... */
//! auto_tmpdir_teardown(h);
//! auto_tmpdir_close(h);
//! ```

#![allow(clippy::missing_safety_doc)]

use auto_tmpdir_core::{Credentials, JobIdentity, TmpdirConfig, TmpdirError, TmpdirLifecycle};
use libc::c_char;
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::ptr;
use thiserror::Error;

/// Opaque handle to one job step's directory lifecycle
pub struct AutoTmpdirHandle {
    lifecycle: TmpdirLifecycle<TmpdirConfig>,
    tmpdir: Option<CString>,
}

/// Status codes
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoTmpdirStatus {
    /// Success
    Ok = 0,
    /// Null pointer argument
    NullPointer = 1,
    /// Invalid UTF-8
    InvalidUtf8 = 2,
    /// Configuration rejected
    Config = 3,
    /// Identity switch failed
    Privilege = 4,
    /// No usable base directory
    PathResolution = 5,
    /// Directory could not be created
    Create = 6,
    /// Bind isolation failed
    Mount = 7,
    /// Teardown left something behind; the job is unaffected
    Teardown = 8,
    /// Call made in the wrong lifecycle state
    Lifecycle = 9,
    /// Unknown error
    Unknown = 99,
}

#[derive(Debug, Error)]
enum FfiError {
    #[error("{0} is null")]
    NullPointer(&'static str),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] TmpdirError),
}

impl FfiError {
    fn status(&self) -> AutoTmpdirStatus {
        match self {
            Self::NullPointer(_) => AutoTmpdirStatus::NullPointer,
            Self::InvalidUtf8(_) => AutoTmpdirStatus::InvalidUtf8,
            Self::Json(_) => AutoTmpdirStatus::Config,
            Self::Core(e) if !e.is_fatal() => AutoTmpdirStatus::Teardown,
            Self::Core(e) => match e {
                TmpdirError::Config(_) => AutoTmpdirStatus::Config,
                TmpdirError::Privilege(_) => AutoTmpdirStatus::Privilege,
                TmpdirError::PathResolution { .. } => AutoTmpdirStatus::PathResolution,
                TmpdirError::NotADirectory(_) | TmpdirError::Create { .. } => {
                    AutoTmpdirStatus::Create
                }
                TmpdirError::Mount(_) => AutoTmpdirStatus::Mount,
                TmpdirError::Lifecycle(_) => AutoTmpdirStatus::Lifecycle,
                _ => AutoTmpdirStatus::Unknown,
            },
        }
    }
}

// Thread-local error message
thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn set_last_error(msg: String) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = Some(msg);
    });
}

fn fail(error: &FfiError) -> AutoTmpdirStatus {
    set_last_error(error.to_string());
    error.status()
}

/// Get the last error message
///
/// Returns NULL if no error. The returned string is valid until the next
/// auto_tmpdir call on this thread.
#[unsafe(no_mangle)]
pub extern "C" fn auto_tmpdir_last_error() -> *const c_char {
    thread_local! {
        static ERROR_BUF: RefCell<Option<CString>> = const { RefCell::new(None) };
    }

    LAST_ERROR.with(|e| {
        let err = e.borrow();
        match &*err {
            Some(msg) => ERROR_BUF.with(|buf| {
                let cstr = CString::new(msg.as_str()).unwrap_or_default();
                let ptr = cstr.as_ptr();
                *buf.borrow_mut() = Some(cstr);
                ptr
            }),
            None => ptr::null(),
        }
    })
}

unsafe fn parse_config(config_json: *const c_char) -> Result<TmpdirConfig, FfiError> {
    if config_json.is_null() {
        return Ok(TmpdirConfig::default());
    }
    // SAFETY: Caller guarantees config_json is a valid C string
    let text = unsafe { CStr::from_ptr(config_json) }
        .to_str()
        .map_err(|_| FfiError::InvalidUtf8("config_json"))?;
    let config: TmpdirConfig = serde_json::from_str(text)?;
    config.validate()?;
    Ok(config)
}

/// Open a lifecycle handle for one job step
///
/// `config_json` may be NULL for the built-in defaults. Returns NULL on
/// failure. Call `auto_tmpdir_last_error()` for details.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn auto_tmpdir_open(
    job_id: u32,
    step_id: u32,
    task_id: u32,
    uid: u32,
    gid: u32,
    config_json: *const c_char,
) -> *mut AutoTmpdirHandle {
    // SAFETY: forwarded caller guarantee
    let config = match unsafe { parse_config(config_json) } {
        Ok(config) => config,
        Err(e) => {
            fail(&e);
            return ptr::null_mut();
        }
    };

    let identity = JobIdentity::from_raw(job_id, step_id, task_id);
    let lifecycle = TmpdirLifecycle::new(config, identity, Credentials::new(uid, gid));
    Box::into_raw(Box::new(AutoTmpdirHandle {
        lifecycle,
        tmpdir: None,
    }))
}

/// Create the directory tree, set up bind isolation if configured, and
/// make the path available through `auto_tmpdir_tmpdir()`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn auto_tmpdir_provision(handle: *mut AutoTmpdirHandle) -> AutoTmpdirStatus {
    if handle.is_null() {
        return fail(&FfiError::NullPointer("handle"));
    }
    // SAFETY: Caller guarantees handle came from auto_tmpdir_open and is not aliased
    let handle = unsafe { &mut *handle };

    match activate(&mut handle.lifecycle) {
        Ok(value) => match CString::new(value) {
            Ok(value) => {
                handle.tmpdir = Some(value);
                AutoTmpdirStatus::Ok
            }
            Err(_) => fail(&FfiError::InvalidUtf8("tmpdir")),
        },
        Err(e) => fail(&FfiError::Core(e)),
    }
}

fn activate(lifecycle: &mut TmpdirLifecycle<TmpdirConfig>) -> Result<String, TmpdirError> {
    lifecycle.provision()?;
    lifecycle.bind()?;
    let (_, value) = lifecycle.activate()?;
    Ok(value)
}

/// The exported TMPDIR value
///
/// Returns NULL before a successful `auto_tmpdir_provision()`. The string is
/// owned by the handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn auto_tmpdir_tmpdir(handle: *const AutoTmpdirHandle) -> *const c_char {
    if handle.is_null() {
        set_last_error("handle is null".into());
        return ptr::null();
    }
    // SAFETY: Caller guarantees handle came from auto_tmpdir_open
    let handle = unsafe { &*handle };
    handle.tmpdir.as_ref().map_or(ptr::null(), |s| s.as_ptr())
}

/// Unmount and remove what this step owns
///
/// Returns `Teardown` when something could not be removed; that never
/// concerns the job's own exit status.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn auto_tmpdir_teardown(handle: *mut AutoTmpdirHandle) -> AutoTmpdirStatus {
    if handle.is_null() {
        return fail(&FfiError::NullPointer("handle"));
    }
    // SAFETY: Caller guarantees handle came from auto_tmpdir_open and is not aliased
    let handle = unsafe { &mut *handle };
    handle.tmpdir = None;

    match handle.lifecycle.teardown() {
        Ok(()) => AutoTmpdirStatus::Ok,
        Err(e) => fail(&FfiError::Core(e)),
    }
}

/// Free a handle
///
/// Does not tear anything down; call `auto_tmpdir_teardown()` first.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn auto_tmpdir_close(handle: *mut AutoTmpdirHandle) {
    if !handle.is_null() {
        // SAFETY: Caller guarantees handle is valid and was allocated by Box
        drop(unsafe { Box::from_raw(handle) });
    }
}

/// Get library version
#[unsafe(no_mangle)]
pub extern "C" fn auto_tmpdir_version() -> *const c_char {
    static VERSION: Lazy<CString> =
        Lazy::new(|| CString::new(env!("CARGO_PKG_VERSION")).unwrap_or_default());
    VERSION.as_ptr()
}
