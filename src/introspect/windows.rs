//! Windows introspection: SSDT-based syscall name resolution plus an
//! `EPROCESS`/`ActiveProcessLinks` walk of `PsActiveProcessHead`.
//!
//! Grounded on `examples/original_source/nitro/backends/windows/backend.py`
//! (`get_syscall_name`, `find_eprocess`, `find_syscall_nb`) and
//! `.../windows/process.py` (`WindowsProcess.__init__`, the PEB/command-line
//! and `SeAuditProcessCreationInfo`/full-path walks).

use log::debug;

use crate::error::{NitroError, Result};
use crate::hooks::SelectorLookup;
use crate::memory::{MemoryView, OsType};
use crate::symbols::SdtTable;
use crate::syscall::{Process, RawEvent};

use super::MAX_PROCESS_WALK;

/// `_UNICODE_STRING` is a fixed, ABI-stable layout (not symbol-bundle
/// derived): `USHORT Length; USHORT MaximumLength; (padding); PVOID
/// Buffer;`.
const UNICODE_STRING_LENGTH_OFFSET: u64 = 0;
const UNICODE_STRING_BUFFER_OFFSET: u64 = 8;

const WINDOWS_TICK: i64 = 10_000_000;
const SEC_TO_UNIX_EPOCH: i64 = 11_644_473_600;

pub struct WindowsIntrospection {
    sdt: SdtTable,
}

impl WindowsIntrospection {
    pub fn new(sdt: SdtTable) -> Self {
        WindowsIntrospection { sdt }
    }
}

impl SelectorLookup for WindowsIntrospection {
    fn find_selector(&self, name: &str) -> Option<u32> {
        self.sdt.find_syscall_nb(name)
    }
}

impl super::OsIntrospection for WindowsIntrospection {
    fn os_type(&self) -> OsType {
        OsType::Windows
    }

    /// `sdt[(rax>>12)&3][rax&0xFFF]` (spec §3/§4.4); an unmapped SSN falls
    /// back to `Table{n}!Unknown` rather than erroring, since only tables 0
    /// (nt) and 1 (win32k) are ever populated and this path is reachable
    /// under normal operation (spec.md's own comment: "this should not be
    /// reached").
    fn resolve_name(&self, _view: &dyn MemoryView, event: &RawEvent) -> Result<String> {
        let rax = event.regs.rax;
        let ssn = (rax & 0xFFF) as u32;
        let table = ((rax >> 12) & 0x3) as u32;
        match self.sdt.lookup(table, ssn) {
            Some(name) => Ok(name.to_string()),
            None => Ok(format!("Table{}!Unknown", table)),
        }
    }

    fn find_process(&self, view: &dyn MemoryView, cr3: u64) -> Result<Process> {
        let ps_head = view.ksym_to_vaddr("PsActiveProcessHead")?;
        let mut flink = view.read_addr_va(ps_head, 0)?;

        let active_links_off = view.get_offset("EPROCESS", "ActiveProcessLinks")? as u64;
        let dir_table_base_off = view.get_offset("KPROCESS", "DirectoryTableBase")? as u64;

        let mut steps = 0;
        while flink != ps_head {
            if steps >= MAX_PROCESS_WALK {
                return Err(NitroError::ProcessNotFound(cr3));
            }
            steps += 1;

            let eproc = flink - active_links_off;
            let dir_table_base = view.read_addr_va(eproc + dir_table_base_off, 0)?;
            if dir_table_base == cr3 {
                return build_process(view, cr3, eproc);
            }
            flink = view.read_addr_va(flink, 0)?;
        }
        Err(NitroError::ProcessNotFound(cr3))
    }
}

fn read_unicode_string(view: &dyn MemoryView, addr: u64, pid: i32) -> Result<String> {
    let length = view.read_bytes(addr + UNICODE_STRING_LENGTH_OFFSET, pid, 2)?;
    let length = u16::from_le_bytes([length[0], length[1]]) as usize;
    let buffer_addr = view.read_addr_va(addr + UNICODE_STRING_BUFFER_OFFSET, pid)?;
    let raw = view.read_bytes(buffer_addr, pid, length)?;
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

/// `WindowsProcess.__init__` (`nitro/backends/windows/process.py`), minus
/// the `datetime`-formatted create time (kept as a raw unix timestamp here,
/// spec §3's `create_time: Option<i64>`).
fn build_process(view: &dyn MemoryView, cr3: u64, eproc: u64) -> Result<Process> {
    let image_file_name_off = view.get_offset("EPROCESS", "ImageFileName")? as u64;
    let name = view.read_str_va(eproc + image_file_name_off, 0)?;

    let pid_off = view.get_offset("EPROCESS", "UniqueProcessId")? as u64;
    let pid = view.read_addr_va(eproc + pid_off, 0)? as i32;

    let peb_off = view.get_offset("EPROCESS", "Peb")? as u64;
    let peb_addr = view.read_addr_va(eproc + peb_off, 0)?;
    let command_line = if peb_addr != 0 {
        let proc_params_off = view.get_offset("PEB", "ProcessParameters")? as u64;
        let proc_params_addr = view.read_addr_va(peb_addr + proc_params_off, 0)?;
        let cmdline_off = view.get_offset("RTL_USER_PROCESS_PARAMETERS", "CommandLine")? as u64;
        read_unicode_string(view, proc_params_addr + cmdline_off, 0).ok()
    } else {
        None
    };

    // `SeAuditProcessCreationInfo` is the embedded `SE_AUDIT_PROCESS_CREATION_INFO`
    // struct, whose sole field `ImageFileName` sits at offset 0 — the read below
    // already yields the `OBJECT_NAME_INFORMATION` pointer, not a struct base.
    let audit_off = view.get_offset("EPROCESS", "SeAuditProcessCreationInfo")? as u64;
    let object_name_info_addr = view.read_addr_va(eproc + audit_off, 0)?;
    let image_path = if object_name_info_addr != 0 {
        let name_off = view.get_offset("OBJECT_NAME_INFORMATION", "Name")? as u64;
        read_unicode_string(view, object_name_info_addr + name_off, 0).ok()
    } else {
        None
    };

    let create_time_off = view.get_offset("EPROCESS", "CreateTime")? as u64;
    let raw_ticks = view.read_addr_va(eproc + create_time_off, 0)? as i64;
    let create_time = Some(raw_ticks / WINDOWS_TICK - SEC_TO_UNIX_EPOCH);

    let parent_pid_off = view.get_offset("EPROCESS", "InheritedFromUniqueProcessId")? as u64;
    let parent_pid = view.read_addr_va(eproc + parent_pid_off, 0)? as i32;

    let wow64_off = view.get_offset("EPROCESS", "Wow64Process")? as u64;
    let iswow64 = view.read_addr_va(eproc + wow64_off, 0)? != 0;

    debug!("resolved windows process {} (pid {})", name, pid);

    Ok(Process {
        cr3,
        descriptor_addr: eproc,
        pid,
        name,
        command_line,
        image_path,
        create_time,
        parent_pid: Some(parent_pid),
        iswow64: Some(iswow64),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hooks::SelectorLookup;
    use crate::introspect::OsIntrospection;
    use crate::memory::test_double::NullMemoryView;
    use crate::symbols::SymbolBundle;

    const SAMPLE: &str = r#"{
        "syscall_table": [
            {"divider": "Table 0 @ 0xfffff80000000000"},
            {"entry": 17, "symbol": {"symbol": "nt!NtOpenKey"}},
            {"divider": "Table 1 @ 0xfffff80000001000"}
        ],
        "offsets": {}
    }"#;

    #[test]
    fn resolve_name_falls_back_to_table_unknown_for_unmapped_ssn() {
        let bundle = SymbolBundle::from_json(SAMPLE).unwrap();
        let sdt = SdtTable::from_bundle(&bundle).unwrap();
        let intro = WindowsIntrospection::new(sdt);
        let view = NullMemoryView::new(OsType::Windows);
        let mut regs = crate::kvm::Regs::default();
        regs.rax = 0x999; // unmapped ssn
        let event = RawEvent {
            direction: crate::kvm::Direction::Enter,
            kind: crate::kvm::Kind::Syscall,
            regs,
            sregs: crate::kvm::SRegs::default(),
            vcpu_index: 0,
        };
        let name = intro.resolve_name(&view, &event).unwrap();
        assert_eq!(name, "Table0!Unknown");
    }

    #[test]
    fn resolve_name_resolves_a_mapped_ssn() {
        let bundle = SymbolBundle::from_json(SAMPLE).unwrap();
        let sdt = SdtTable::from_bundle(&bundle).unwrap();
        let intro = WindowsIntrospection::new(sdt);
        let view = NullMemoryView::new(OsType::Windows);
        let mut regs = crate::kvm::Regs::default();
        regs.rax = 17;
        let event = RawEvent {
            direction: crate::kvm::Direction::Enter,
            kind: crate::kvm::Kind::Syscall,
            regs,
            sregs: crate::kvm::SRegs::default(),
            vcpu_index: 0,
        };
        assert_eq!(intro.resolve_name(&view, &event).unwrap(), "nt!NtOpenKey");
    }

    #[test]
    fn find_selector_delegates_to_sdt() {
        let bundle = SymbolBundle::from_json(SAMPLE).unwrap();
        let sdt = SdtTable::from_bundle(&bundle).unwrap();
        let intro = WindowsIntrospection::new(sdt);
        assert_eq!(intro.find_selector("NtOpenKey"), Some(17));
        assert_eq!(intro.find_selector("NoSuchSyscall"), None);
    }
}
