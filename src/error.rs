//! Error taxonomy for the Nitro tracer.
//!
//! One variant per error kind named in the spec's error-handling design.
//! Kept as a single enum (rather than the teacher's untyped
//! `simple_error::SimpleError`) so that call sites distinguish, say, a
//! `MemoryAccessError` raised from inside a hook (tallied and swallowed)
//! from a `VcpuIoFailed` (fatal, terminates the listen loop).

use std::io;

use nix::unistd::Pid;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NitroError>;

#[derive(Error, Debug)]
pub enum NitroError {
    #[error("could not find hypervisor process for domain '{0}'")]
    HypervisorNotFound(String),

    #[error("failed to attach to hypervisor process {pid}: {source}")]
    AttachFailed { pid: Pid, source: io::Error },

    #[error("vcpu ioctl failed: {0}")]
    VcpuIoFailed(#[from] nix::Error),

    #[error("memory access failed at {addr:#x} (pid {pid}): {reason}")]
    MemoryAccessError {
        addr: u64,
        pid: i32,
        reason: String,
    },

    #[error("introspection failure: {0}")]
    IntrospectionFailure(String),

    #[error("invalid symbol bundle: {0}")]
    SymbolBundleInvalid(#[from] serde_json::Error),

    #[error("process not found for cr3 {0:#x}")]
    ProcessNotFound(u64),

    #[error("cannot find selector number for syscall '{0}'")]
    FilterLookupError(String),

    #[error("failed to initialize memory introspection for domain '{0}'")]
    VmiInitFailed(String),

    #[error("hook dispatch error: {0}")]
    HookDispatchError(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl NitroError {
    /// True for the kinds that the hook dispatcher is expected to tally
    /// and swallow rather than let escape `process_event` (spec §7).
    pub fn is_hook_recoverable(&self) -> bool {
        matches!(
            self,
            NitroError::MemoryAccessError { .. } | NitroError::IntrospectionFailure(_)
        )
    }
}
