//! C4: Introspection Backend. One `process_event` algorithm shared by the
//! Windows and Linux variants (spec §4.4); the OS-specific halves (syscall
//! name resolution, process-list walk) are supplied through the
//! `OsIntrospection` trait and implemented in `windows`/`linux`.
//!
//! Grounded on `examples/original_source/nitro/backends/backend.py`
//! (`process_event`'s cache-flush / associate-process / stack push-pop
//! skeleton, shared verbatim by both OS backends there) and
//! `src/kernel.rs` (symbol/offset-driven struct reading, bounded walks).

pub mod linux;
pub mod windows;

use std::collections::HashMap;

use log::warn;

use crate::config::Config;
use crate::error::Result;
use crate::hooks::{HookDispatcher, SelectorLookup};
use crate::kvm::Direction;
use crate::memory::{flush_all_caches, MemoryView, OsType};
use crate::syscall::{clean_name, ArgumentMap, Process, RawEvent, SyscallRecord};

/// Upper bound on the number of nodes walked while resolving a process
/// (spec §4.4's Linux note: "should additionally bound the walk... to
/// tolerate corruption"), applied to both OS variants.
pub const MAX_PROCESS_WALK: usize = 4096;

/// The OS-specific half of introspection: given a raw event and a memory
/// view, resolve a syscall's full (dirty) name and resolve/build the
/// `Process` that owns a given `cr3`. Everything else — caching, the stack,
/// hook dispatch — is common and lives in `Backend`.
pub trait OsIntrospection: SelectorLookup {
    fn os_type(&self) -> OsType;

    /// Raw (possibly module-prefixed) syscall name for this event, before
    /// `clean_name` strips the OS-specific decoration.
    fn resolve_name(&self, view: &dyn MemoryView, event: &RawEvent) -> Result<String>;

    /// Walks the OS's process list looking for a `cr3` match, bounded by
    /// `MAX_PROCESS_WALK`. Returns `Err(ProcessNotFound)` if the walk
    /// completes (or the bound is hit) without a match.
    fn find_process(&self, view: &dyn MemoryView, cr3: u64) -> Result<Process>;
}

/// Common Backend (spec §4.4): cache invalidation, process cache, per-VCPU
/// syscall stack, and hook dispatch, generic over the OS-specific half.
pub struct Backend<O: OsIntrospection> {
    os: O,
    view: Box<dyn MemoryView>,
    config: Config,
    hooks: HookDispatcher,
    processes: HashMap<u64, Process>,
    /// Indexed by `vcpu_index`; a real LIFO stack per
    /// `nitro/backends/{linux,windows}/backend.py`'s `syscall_stack`.
    stacks: Vec<Vec<SyscallRecord>>,
}

impl<O: OsIntrospection> Backend<O> {
    pub fn new(os: O, view: Box<dyn MemoryView>, config: Config, num_vcpus: usize) -> Self {
        Backend {
            os,
            view,
            config,
            hooks: HookDispatcher::new(),
            processes: HashMap::new(),
            stacks: (0..num_vcpus).map(|_| Vec::new()).collect(),
        }
    }

    pub fn hooks(&self) -> &HookDispatcher {
        &self.hooks
    }

    pub fn stats(&self) -> crate::hooks::Stats {
        self.hooks.stats()
    }

    fn associate_process(&mut self, cr3: u64) -> Option<Process> {
        if let Some(p) = self.processes.get(&cr3) {
            return Some(p.clone());
        }
        match self.os.find_process(self.view.as_ref(), cr3) {
            Ok(process) => {
                self.processes.insert(cr3, process.clone());
                Some(process)
            }
            Err(e) => {
                warn!("failed to resolve process for cr3 {:#x}: {}", cr3, e);
                None
            }
        }
    }

    /// The shared `process_event` algorithm (spec §4.4 steps 1-5):
    /// 1. flush the memory view's caches
    /// 2. resolve (or reuse the cached) `Process` owning this `cr3`
    /// 3. on EXIT, pop the matching ENTER record off this VCPU's stack
    ///    (or fabricate an `Unknown` one if the stack is empty/mismatched)
    /// 4. on ENTER, resolve the syscall name, build an `ArgumentMap`, push
    ///    a copy onto the stack for the matching EXIT
    /// 5. dispatch hooks, with direct access to the event's `ArgumentMap`
    pub fn process_event(&mut self, event: RawEvent) -> SyscallRecord {
        if self.config.flush_caches_every_event {
            flush_all_caches(self.view.as_ref());
        }

        let cr3 = event.cr3();
        let process = self.associate_process(cr3);
        let vcpu = event.vcpu_index as usize;
        let pid = process.as_ref().map(|p| p.pid).unwrap_or(-1);

        let mut record = match event.direction {
            Direction::Exit => match self.stacks.get_mut(vcpu).and_then(|s| s.pop()) {
                Some(mut entry) => {
                    entry.event = event;
                    entry
                }
                None => SyscallRecord::unknown(event, process.clone()),
            },
            Direction::Enter => {
                let full_name = match self.os.resolve_name(self.view.as_ref(), &event) {
                    Ok(name) => name,
                    Err(e) => {
                        warn!("failed to resolve syscall name: {}", e);
                        "Unknown".to_string()
                    }
                };
                let cleaned = clean_name(self.os.os_type(), &full_name);
                let record = SyscallRecord {
                    event,
                    full_name,
                    name: cleaned,
                    process: process.clone(),
                    hook_payload: None,
                    modified: HashMap::new(),
                };
                if let Some(stack) = self.stacks.get_mut(vcpu) {
                    stack.push(clone_for_stack(&record));
                }
                record
            }
        };

        let mut args = match event.direction {
            Direction::Exit => ArgumentMap::for_exit(record.event, pid, self.view.as_ref()),
            Direction::Enter => {
                ArgumentMap::for_entry(self.os.os_type(), record.event, pid, self.view.as_ref())
            }
        };
        self.hooks.dispatch(&mut record, &mut args);
        record.event = args.event();
        record.modified = args.modified().clone();

        record
    }

    /// Resolves the selector number for a syscall name through the
    /// OS-specific half (`SdtTable::find_syscall_nb` /
    /// `SyscallNameMap::index_of`). The façade (`lib.rs`) calls this before
    /// pushing a kernel-side filter through its own `VmHandle` — `Backend`
    /// has no handle to the driver layer itself.
    pub fn find_selector(&self, name: &str) -> Option<u32> {
        self.os.find_selector(name)
    }

    pub fn filtering_enabled(&self) -> bool {
        self.config.syscall_filtering
    }

    pub fn define_hook(&self, name: &str, direction: Direction, callback: crate::hooks::HookFn) {
        self.hooks.define_hook(name, direction, callback);
    }

    pub fn undefine_hook(&self, name: &str, direction: Direction) {
        self.hooks.undefine_hook(name, direction);
    }
}

fn clone_for_stack(record: &SyscallRecord) -> SyscallRecord {
    SyscallRecord {
        event: record.event,
        full_name: record.full_name.clone(),
        name: record.name.clone(),
        process: record.process.clone(),
        hook_payload: record.hook_payload.clone(),
        modified: record.modified.clone(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kvm::{Kind, Regs, SRegs};
    use crate::memory::test_double::NullMemoryView;

    struct FakeOs {
        os: OsType,
        name: String,
        process: Option<Process>,
    }

    impl SelectorLookup for FakeOs {
        fn find_selector(&self, _name: &str) -> Option<u32> {
            Some(1)
        }
    }

    impl OsIntrospection for FakeOs {
        fn os_type(&self) -> OsType {
            self.os
        }
        fn resolve_name(&self, _view: &dyn MemoryView, _event: &RawEvent) -> Result<String> {
            Ok(self.name.clone())
        }
        fn find_process(&self, _view: &dyn MemoryView, cr3: u64) -> Result<Process> {
            self.process.clone().ok_or(crate::error::NitroError::ProcessNotFound(cr3))
        }
    }

    fn sample_event(direction: Direction, vcpu: u32, cr3: u64) -> RawEvent {
        let mut sregs = SRegs::default();
        sregs.cr3 = cr3;
        RawEvent {
            direction,
            kind: Kind::Syscall,
            regs: Regs::default(),
            sregs,
            vcpu_index: vcpu,
        }
    }

    #[test]
    fn enter_then_exit_pops_matching_stack_entry() {
        let process = Process {
            cr3: 7,
            descriptor_addr: 0x1000,
            pid: 42,
            name: "test".into(),
            command_line: None,
            image_path: None,
            create_time: None,
            parent_pid: None,
            iswow64: None,
        };
        let os = FakeOs {
            os: OsType::Linux,
            name: "sys_open".into(),
            process: Some(process),
        };
        let view = Box::new(NullMemoryView::new(OsType::Linux));
        let mut backend = Backend::new(os, view, Config::default(), 1);

        let enter = backend.process_event(sample_event(Direction::Enter, 0, 7));
        assert_eq!(enter.name, "open");
        assert!(backend.stacks[0].len() == 1);

        let exit = backend.process_event(sample_event(Direction::Exit, 0, 7));
        assert_eq!(exit.name, "open");
        assert!(backend.stacks[0].is_empty());
    }

    #[test]
    fn exit_with_empty_stack_fabricates_unknown() {
        let os = FakeOs {
            os: OsType::Linux,
            name: "sys_open".into(),
            process: None,
        };
        let view = Box::new(NullMemoryView::new(OsType::Linux));
        let mut backend = Backend::new(os, view, Config::default(), 1);

        let exit = backend.process_event(sample_event(Direction::Exit, 0, 9));
        assert_eq!(exit.name, "Unknown");
        assert!(exit.process.is_none());
    }

    #[test]
    fn failed_process_lookup_still_returns_a_record() {
        let os = FakeOs {
            os: OsType::Linux,
            name: "sys_write".into(),
            process: None,
        };
        let view = Box::new(NullMemoryView::new(OsType::Linux));
        let mut backend = Backend::new(os, view, Config::default(), 1);

        let record = backend.process_event(sample_event(Direction::Enter, 0, 123));
        assert!(record.process.is_none());
        assert_eq!(record.name, "write");
    }
}
