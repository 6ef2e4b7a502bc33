#![deny(clippy::print_stdout, clippy::print_stderr, clippy::unwrap_used)]
// TODO: more checks
//#![warn(
//    clippy::pedantic,
//)]
//#![allow(
//    clippy::similar_names,
//    cast_sign_loss,
//    missing_errors_doc,
//    cast_possible_truncation,
//    cast_possible_wrap
//)]

//! Façade: `NitroBuilder` attaches to a hypervisor process and wires the
//! driver, listener, memory view and OS-specific introspection backend
//! together; `Nitro` then drives the blocking `listen()` loop a front-end
//! pulls from, one event at a time.

pub mod config;
pub mod error;
pub mod hooks;
pub mod introspect;
pub mod kvm;
pub mod listener;
pub mod memory;
pub mod symbols;
pub mod syscall;

use nix::unistd::Pid;

use config::Config;
use error::{NitroError, Result};
use hooks::{HookFn, Stats, SyscallFilterSink};
use introspect::linux::LinuxIntrospection;
use introspect::windows::WindowsIntrospection;
use introspect::Backend;
use kvm::driver::KvmDriver;
use kvm::Direction;
use listener::Listener;
use memory::{MemoryView, OsType};
use symbols::{SdtTable, SymbolBundle, SyscallNameMap};
use syscall::SyscallRecord;

/// The two concrete `Backend<O>` instantiations, chosen at build time by
/// the caller-supplied `OsType`. `OsIntrospection` is generic-parameterized
/// rather than object-safe, so an enum is the idiomatic way to pick between
/// the two at runtime without a second indirection layer.
enum AnyBackend {
    Windows(Backend<WindowsIntrospection>),
    Linux(Backend<LinuxIntrospection>),
}

impl AnyBackend {
    fn process_event(&mut self, event: syscall::RawEvent) -> SyscallRecord {
        match self {
            AnyBackend::Windows(b) => b.process_event(event),
            AnyBackend::Linux(b) => b.process_event(event),
        }
    }

    fn find_selector(&self, name: &str) -> Option<u32> {
        match self {
            AnyBackend::Windows(b) => b.find_selector(name),
            AnyBackend::Linux(b) => b.find_selector(name),
        }
    }

    fn filtering_enabled(&self) -> bool {
        match self {
            AnyBackend::Windows(b) => b.filtering_enabled(),
            AnyBackend::Linux(b) => b.filtering_enabled(),
        }
    }

    fn define_hook(&self, name: &str, direction: Direction, callback: HookFn) {
        match self {
            AnyBackend::Windows(b) => b.define_hook(name, direction, callback),
            AnyBackend::Linux(b) => b.define_hook(name, direction, callback),
        }
    }

    fn undefine_hook(&self, name: &str, direction: Direction) {
        match self {
            AnyBackend::Windows(b) => b.undefine_hook(name, direction),
            AnyBackend::Linux(b) => b.undefine_hook(name, direction),
        }
    }

    fn stats(&self) -> Stats {
        match self {
            AnyBackend::Windows(b) => b.stats(),
            AnyBackend::Linux(b) => b.stats(),
        }
    }
}

/// Builds a `Nitro` session: attach to the hypervisor process, arm the
/// trap on every VCPU, and construct the OS-specific introspection backend
/// from a caller-supplied `MemoryView` and symbol bundle. The `MemoryView`
/// implementation itself is an external collaborator (spec §1/§4.3) — this
/// crate only defines the trait it must satisfy.
pub struct NitroBuilder {
    pid: Pid,
    os: OsType,
    view: Box<dyn MemoryView>,
    symbols: SymbolBundle,
    config: Config,
}

impl NitroBuilder {
    pub fn new(pid: Pid, os: OsType, view: Box<dyn MemoryView>, symbols: SymbolBundle) -> Self {
        NitroBuilder {
            pid,
            os,
            view,
            symbols,
            config: Config::default(),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Nitro> {
        let driver = KvmDriver::open()?;
        let vm = driver.attach(self.pid)?;
        let listener = Listener::start(vm)?;
        let num_vcpus = listener.vcpu_count();

        let backend = match self.os {
            OsType::Windows => {
                let sdt = SdtTable::from_bundle(&self.symbols)?;
                AnyBackend::Windows(Backend::new(
                    WindowsIntrospection::new(sdt),
                    self.view,
                    self.config,
                    num_vcpus,
                ))
            }
            OsType::Linux => {
                let sys_call_table = self.view.ksym_to_vaddr("sys_call_table")?;
                let names = SyscallNameMap::build(self.view.as_ref(), sys_call_table)?;
                AnyBackend::Linux(Backend::new(
                    LinuxIntrospection::new(names),
                    self.view,
                    self.config,
                    num_vcpus,
                ))
            }
        };

        Ok(Nitro { listener, backend })
    }
}

/// A running trace session. `listen()` blocks for the next syscall event,
/// runs it through introspection and the hook dispatcher, and releases the
/// producing VCPU before returning — mirroring the original's generator
/// (`for syscall in backend.listen(): ...`) without the borrow-incompatible
/// parts of that shape (see `listener::Listener`'s doc comment).
pub struct Nitro {
    listener: Listener,
    backend: AnyBackend,
}

impl Nitro {
    /// Registers a hook, pushing a kernel-side selector filter first when
    /// filtering is enabled (spec §4.5) so the hypervisor only traps
    /// syscalls someone is actually listening for.
    pub fn define_hook(&mut self, name: &str, direction: Direction, callback: HookFn) -> Result<()> {
        if self.backend.filtering_enabled() {
            let selector = self
                .backend
                .find_selector(name)
                .ok_or_else(|| NitroError::FilterLookupError(name.to_string()))?;
            self.listener.add_syscall_filter(selector)?;
        }
        self.backend.define_hook(name, direction, callback);
        Ok(())
    }

    pub fn undefine_hook(&mut self, name: &str, direction: Direction) -> Result<()> {
        if self.backend.filtering_enabled() {
            if let Some(selector) = self.backend.find_selector(name) {
                self.listener.remove_syscall_filter(selector)?;
            }
        }
        self.backend.undefine_hook(name, direction);
        Ok(())
    }

    /// Pulls the next event, runs introspection and hook dispatch, and
    /// releases the VCPU with any hook-driven register writes applied.
    /// `Ok(None)` signals end-of-stream (the domain went inactive).
    pub fn listen(&mut self) -> Result<Option<SyscallRecord>> {
        let mut pending = match self.listener.next_event()? {
            Some(p) => p,
            None => return Ok(None),
        };
        let record = self.backend.process_event(*pending.event());
        *pending.event_mut() = record.event;
        pending.resume();
        Ok(Some(record))
    }

    pub fn stats(&self) -> Stats {
        self.backend.stats()
    }

    pub fn stop(self) -> Result<()> {
        self.listener.stop()
    }
}
