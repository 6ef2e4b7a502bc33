//! C5: Hook Dispatcher. Named per-direction callback registry, guarded
//! dispatch with the stats counters of spec §4.5/§7, and (through
//! `SelectorLookup`/`SyscallFilterSink`) the optional kernel-level filter
//! push.
//!
//! Grounded on `examples/original_source/nitro/backends/backend.py`
//! (`dispatch_hooks`, `define_hook`/`undefine_hook`, the `stats` dict).
//! The Python callback signature is `(syscall, backend) -> None`, with
//! `syscall.args[i]` backed by the backend's live memory view. Handing a
//! hook the whole backend doesn't translate under Rust's borrowing rules
//! (the backend is already borrowed mutably by the dispatch loop), so a
//! hook here gets the `SyscallRecord` plus a standalone `ArgumentMap` —
//! the latter owns its own copy of the event and borrows only the
//! `MemoryView`, so the two parameters never alias.

use std::collections::HashMap;
use std::sync::RwLock;

use log::{debug, error, info};

use crate::error::{NitroError, Result};
use crate::kvm::Direction;
use crate::syscall::{ArgumentMap, SyscallRecord};

pub type HookFn =
    Box<dyn for<'a> Fn(&mut SyscallRecord, &mut ArgumentMap<'a>) -> Result<()> + Send + Sync>;

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct Stats {
    pub memory_access_error: u64,
    pub introspection_failure: u64,
    pub misc_error: u64,
    pub hooks_processed: u64,
    pub hooks_completed: u64,
}

impl Stats {
    /// Property 6 (spec §8): `hooks_processed == hooks_completed +
    /// memory_access_error + introspection_failure + misc_error`.
    pub fn is_conserved(&self) -> bool {
        self.hooks_processed
            == self.hooks_completed
                + self.memory_access_error
                + self.introspection_failure
                + self.misc_error
    }
}

/// Resolves a cleaned syscall name to its selector number; implemented by
/// the OS-specific backend (`SdtTable::find_syscall_nb` on Windows,
/// `SyscallNameMap::index_of` on Linux).
pub trait SelectorLookup {
    fn find_selector(&self, name: &str) -> Option<u32>;
}

/// The kernel-filter half of C1 that the dispatcher pushes into when a
/// hook is registered/unregistered with filtering enabled.
pub trait SyscallFilterSink {
    fn add_syscall_filter(&mut self, selector: u32) -> Result<()>;
    fn remove_syscall_filter(&mut self, selector: u32) -> Result<()>;
}

pub struct HookDispatcher {
    enter: RwLock<HashMap<String, HookFn>>,
    exit: RwLock<HashMap<String, HookFn>>,
    stats: RwLock<Stats>,
}

impl Default for HookDispatcher {
    fn default() -> Self {
        HookDispatcher {
            enter: RwLock::new(HashMap::new()),
            exit: RwLock::new(HashMap::new()),
            stats: RwLock::new(Stats::default()),
        }
    }
}

impl HookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, direction: Direction) -> &RwLock<HashMap<String, HookFn>> {
        match direction {
            Direction::Enter => &self.enter,
            Direction::Exit => &self.exit,
        }
    }

    pub fn define_hook(&self, name: &str, direction: Direction, callback: HookFn) {
        info!("defining {:?} hook on {}", direction, name);
        self.table(direction)
            .write()
            .expect("hook registry lock poisoned")
            .insert(name.to_string(), callback);
    }

    pub fn undefine_hook(&self, name: &str, direction: Direction) {
        info!("removing hook on {}", name);
        self.table(direction)
            .write()
            .expect("hook registry lock poisoned")
            .remove(name);
    }

    /// Registers a hook and, if filtering is enabled, pushes the
    /// corresponding selector into the hypervisor via `sink`.
    pub fn define_hook_filtered(
        &self,
        name: &str,
        direction: Direction,
        callback: HookFn,
        lookup: &dyn SelectorLookup,
        sink: &mut dyn SyscallFilterSink,
    ) -> Result<()> {
        let selector = lookup
            .find_selector(name)
            .ok_or_else(|| NitroError::FilterLookupError(name.to_string()))?;
        sink.add_syscall_filter(selector)?;
        self.define_hook(name, direction, callback);
        Ok(())
    }

    pub fn undefine_hook_filtered(
        &self,
        name: &str,
        direction: Direction,
        lookup: &dyn SelectorLookup,
        sink: &mut dyn SyscallFilterSink,
    ) -> Result<()> {
        let selector = lookup
            .find_selector(name)
            .ok_or_else(|| NitroError::FilterLookupError(name.to_string()))?;
        sink.remove_syscall_filter(selector)?;
        self.undefine_hook(name, direction);
        Ok(())
    }

    /// Dispatch policy (spec §4.5): skip entirely if the process is
    /// unresolved. Otherwise run the registered callback (if any) under a
    /// guard that tallies and swallows `MemoryAccessError`/
    /// `IntrospectionFailure`/anything else, and never lets an error
    /// escape.
    pub fn dispatch(&self, record: &mut SyscallRecord, args: &mut ArgumentMap) {
        if record.process.is_none() {
            return;
        }
        let direction = record.event.direction;
        let name = record.name.clone();

        // Held for the duration of the call, matching §5's
        // "snapshot-on-read" requirement for the hook registry.
        let table = self.table(direction).read().expect("hook registry lock poisoned");
        let callback = match table.get(&name) {
            Some(cb) => cb,
            None => return,
        };
        debug!("processing hook {:?} - {}", direction, name);
        let outcome = callback(record, args);
        drop(table);

        let mut stats = self.stats.write().expect("stats lock poisoned");
        stats.hooks_processed += 1;
        match outcome {
            Ok(()) => stats.hooks_completed += 1,
            Err(e) if matches!(e, NitroError::MemoryAccessError { .. }) => {
                stats.memory_access_error += 1;
                error!("memory access error in hook {}: {}", name, e);
            }
            Err(e) if matches!(e, NitroError::IntrospectionFailure(_)) => {
                stats.introspection_failure += 1;
                error!("introspection failure in hook {}: {}", name, e);
            }
            Err(e) => {
                stats.misc_error += 1;
                error!("unexpected error in hook {}: {}", name, e);
            }
        }
    }

    pub fn stats(&self) -> Stats {
        *self.stats.read().expect("stats lock poisoned")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kvm::Kind;
    use crate::memory::test_double::NullMemoryView;
    use crate::memory::OsType;
    use crate::syscall::RawEvent;

    fn sample_record(name: &str, with_process: bool) -> SyscallRecord {
        let event = RawEvent {
            direction: Direction::Enter,
            kind: Kind::Syscall,
            regs: crate::kvm::Regs::default(),
            sregs: crate::kvm::SRegs::default(),
            vcpu_index: 0,
        };
        let process = if with_process {
            Some(crate::syscall::Process {
                cr3: 1,
                descriptor_addr: 2,
                pid: 3,
                name: "test".into(),
                command_line: None,
                image_path: None,
                create_time: None,
                parent_pid: None,
                iswow64: None,
            })
        } else {
            None
        };
        SyscallRecord {
            event,
            full_name: name.to_string(),
            name: name.to_string(),
            process,
            hook_payload: None,
            modified: Default::default(),
        }
    }

    fn sample_args(view: &NullMemoryView) -> ArgumentMap {
        ArgumentMap::for_entry(
            OsType::Linux,
            RawEvent {
                direction: Direction::Enter,
                kind: Kind::Syscall,
                regs: crate::kvm::Regs::default(),
                sregs: crate::kvm::SRegs::default(),
                vcpu_index: 0,
            },
            3,
            view,
        )
    }

    #[test]
    fn dispatch_skips_when_process_unresolved() {
        let dispatcher = HookDispatcher::new();
        dispatcher.define_hook(
            "NtClose",
            Direction::Enter,
            Box::new(|_r, _a| Ok(())),
        );
        let mut record = sample_record("NtClose", false);
        let view = NullMemoryView::new(OsType::Linux);
        let mut args = sample_args(&view);
        dispatcher.dispatch(&mut record, &mut args);
        assert_eq!(dispatcher.stats().hooks_processed, 0);
    }

    #[test]
    fn stats_conservation_holds_after_mixed_outcomes() {
        let dispatcher = HookDispatcher::new();
        dispatcher.define_hook("A", Direction::Enter, Box::new(|_r, _a| Ok(())));
        dispatcher.define_hook(
            "B",
            Direction::Enter,
            Box::new(|_r, _a| {
                Err(NitroError::MemoryAccessError {
                    addr: 0,
                    pid: 0,
                    reason: "boom".into(),
                })
            }),
        );
        dispatcher.define_hook(
            "C",
            Direction::Enter,
            Box::new(|_r, _a| Err(NitroError::IntrospectionFailure("boom".into()))),
        );
        dispatcher.define_hook(
            "D",
            Direction::Enter,
            Box::new(|_r, _a| Err(NitroError::HookDispatchError("boom".into()))),
        );

        let view = NullMemoryView::new(OsType::Linux);
        for name in ["A", "B", "C", "D"] {
            let mut record = sample_record(name, true);
            let mut args = sample_args(&view);
            dispatcher.dispatch(&mut record, &mut args);
        }

        let stats = dispatcher.stats();
        assert_eq!(stats.hooks_processed, 4);
        assert_eq!(stats.hooks_completed, 1);
        assert_eq!(stats.memory_access_error, 1);
        assert_eq!(stats.introspection_failure, 1);
        assert_eq!(stats.misc_error, 1);
        assert!(stats.is_conserved());
    }

    #[test]
    fn undefine_hook_removes_the_callback() {
        let dispatcher = HookDispatcher::new();
        dispatcher.define_hook("A", Direction::Enter, Box::new(|_r, _a| Ok(())));
        dispatcher.undefine_hook("A", Direction::Enter);
        let mut record = sample_record("A", true);
        let view = NullMemoryView::new(OsType::Linux);
        let mut args = sample_args(&view);
        dispatcher.dispatch(&mut record, &mut args);
        assert_eq!(dispatcher.stats().hooks_processed, 0);
    }
}
