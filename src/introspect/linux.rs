//! Linux introspection: `sys_call_table` resolution via `SyscallNameMap`
//! plus an `init_task`/`tasks` `task_struct` walk with the `mm`/`active_mm`
//! fallback.
//!
//! Grounded on `examples/original_source/nitro/backends/linux/backend.py`
//! (`get_syscall_name`, `associate_process`) and `.../linux/process.py`
//! (`LinuxProcess.__init__`).

use log::debug;

use crate::error::{NitroError, Result};
use crate::hooks::SelectorLookup;
use crate::memory::{MemoryView, OsType};
use crate::symbols::SyscallNameMap;
use crate::syscall::{Process, RawEvent};

use super::MAX_PROCESS_WALK;

const VOID_P_SIZE: u64 = 8;

pub struct LinuxIntrospection {
    names: SyscallNameMap,
}

impl LinuxIntrospection {
    pub fn new(names: SyscallNameMap) -> Self {
        LinuxIntrospection { names }
    }
}

impl SelectorLookup for LinuxIntrospection {
    fn find_selector(&self, name: &str) -> Option<u32> {
        self.names.index_of(name)
    }
}

impl super::OsIntrospection for LinuxIntrospection {
    fn os_type(&self) -> OsType {
        OsType::Linux
    }

    /// `sys_call_table[rax]` by index into the handler-name table built
    /// once at startup (`SyscallNameMap::build`), not re-walked per event.
    fn resolve_name(&self, _view: &dyn MemoryView, event: &RawEvent) -> Result<String> {
        let index = event.regs.rax as usize;
        self.names
            .name_at(index)
            .map(|s| s.to_string())
            .ok_or_else(|| {
                NitroError::IntrospectionFailure(format!(
                    "syscall index {} out of range for sys_call_table",
                    index
                ))
            })
    }

    /// `associate_process` (`nitro/backends/linux/backend.py`): walk
    /// `init_task`'s circular `tasks` list, reading each `task_struct`'s
    /// `mm` (falling back to the `mm` field's `active_mm` immediate
    /// successor slot if `mm` is null — a kernel thread's `mm` is NULL but
    /// `active_mm` borrows the previous task's), translating `mm->pgd` to a
    /// physical address and comparing to `cr3`.
    fn find_process(&self, view: &dyn MemoryView, cr3: u64) -> Result<Process> {
        let head = view.ksym_to_vaddr("init_task")?;
        let tasks_off = view.get_offset("task_struct", "tasks")? as u64;
        let mm_off = view.get_offset("task_struct", "mm")? as u64;
        let pgd_off = view.get_offset("mm_struct", "pgd")? as u64;

        let mut next = head;
        let mut steps = 0;
        loop {
            if steps >= MAX_PROCESS_WALK {
                return Err(NitroError::ProcessNotFound(cr3));
            }
            steps += 1;

            let mut mm = view.read_addr_va(next + mm_off, 0)?;
            if mm == 0 {
                mm = view.read_addr_va(next + mm_off + VOID_P_SIZE, 0)?;
            }
            if mm != 0 {
                let pgd = view.read_addr_va(mm + pgd_off, 0)?;
                let pgd_phys = view.kvaddr_to_paddr(pgd)?;
                if pgd_phys == cr3 {
                    return build_process(view, cr3, next);
                }
            }

            next = view.read_addr_va(next + tasks_off, 0)? - tasks_off;
            if next == head {
                return Err(NitroError::ProcessNotFound(cr3));
            }
        }
    }
}

/// `LinuxProcess.__init__` (`nitro/backends/linux/process.py`): just `pid`
/// and `comm` are resolved on Linux — no command-line/image-path/wow64
/// equivalent in the original, so those fields stay `None` on `Process`.
fn build_process(view: &dyn MemoryView, cr3: u64, task_struct: u64) -> Result<Process> {
    let pid_off = view.get_offset("task_struct", "pid")? as u64;
    let name_off = view.get_offset("task_struct", "comm")? as u64;

    let pid = view.read_u32(task_struct + pid_off, 0)? as i32;
    let name = view.read_str_va(task_struct + name_off, 0)?;

    debug!("resolved linux process {} (pid {})", name, pid);

    Ok(Process {
        cr3,
        descriptor_addr: task_struct,
        pid,
        name,
        command_line: None,
        image_path: None,
        create_time: None,
        parent_pid: None,
        iswow64: None,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::introspect::OsIntrospection;
    use crate::memory::test_double::NullMemoryView;

    #[test]
    fn resolve_name_reads_from_the_prebuilt_map() {
        // Exercise name resolution through a `SyscallNameMap` built against
        // a synthetic two-entry `sys_call_table`.
        let mut symbols = std::collections::HashMap::new();
        symbols.insert("sys_open".to_string(), 0x2000u64);
        symbols.insert("sys_close".to_string(), 0x3000u64);
        let full = NullMemoryView {
            symbols,
            ..NullMemoryView::new(OsType::Linux)
        }
        .with_memory(0x1000, 0, 0x2000u64.to_le_bytes().to_vec())
        .with_memory(0x1008, 0, 0x3000u64.to_le_bytes().to_vec());

        let names = SyscallNameMap::build(&full, 0x1000).unwrap();
        let intro = LinuxIntrospection::new(names);
        let event = RawEvent {
            direction: crate::kvm::Direction::Enter,
            kind: crate::kvm::Kind::Syscall,
            regs: {
                let mut r = crate::kvm::Regs::default();
                r.rax = 1;
                r
            },
            sregs: crate::kvm::SRegs::default(),
            vcpu_index: 0,
        };
        assert_eq!(intro.resolve_name(&full, &event).unwrap(), "sys_close");
        assert_eq!(intro.find_selector("sys_close"), Some(1));
    }

    #[test]
    fn resolve_name_errors_for_out_of_range_index() {
        let names = SyscallNameMap::default();
        let intro = LinuxIntrospection::new(names);
        let view = NullMemoryView::new(OsType::Linux);
        let event = RawEvent {
            direction: crate::kvm::Direction::Enter,
            kind: crate::kvm::Kind::Syscall,
            regs: crate::kvm::Regs::default(),
            sregs: crate::kvm::SRegs::default(),
            vcpu_index: 0,
        };
        assert!(intro.resolve_name(&view, &event).is_err());
    }
}
