//! Data model (spec §3) and calling-convention argument decoding (§4.5).
//!
//! Grounded on `examples/original_source/nitro/event.py`, `nitro/syscall.py`
//! and `nitro/backends/{linux,windows}/arguments.py`.

use std::collections::HashMap;

pub use crate::kvm::{Direction, Kind, Regs, SRegs};
use crate::error::{NitroError, Result};
use crate::memory::{MemoryView, OsType};

/// Produced by C1, consumed by C4. Owned, `Copy`-able register blocks —
/// matching the teacher's treatment of `kvm_regs`/`kvm_sregs` as plain
/// value types copied out of hypervisor-mapped memory. Only valid while
/// the VCPU it came from is paused (spec §3 invariant).
#[derive(Copy, Clone, Debug)]
pub struct RawEvent {
    pub direction: Direction,
    pub kind: Kind,
    pub regs: Regs,
    pub sregs: SRegs,
    pub vcpu_index: u32,
}

impl RawEvent {
    pub fn cr3(&self) -> u64 {
        self.sregs.cr3
    }

    fn register(&self, which: RegisterSlot) -> u64 {
        match which {
            RegisterSlot::Rax => self.regs.rax,
            RegisterSlot::Rbx => self.regs.rbx,
            RegisterSlot::Rcx => self.regs.rcx,
            RegisterSlot::Rdx => self.regs.rdx,
            RegisterSlot::Rsi => self.regs.rsi,
            RegisterSlot::Rdi => self.regs.rdi,
            RegisterSlot::Rbp => self.regs.rbp,
            RegisterSlot::R8 => self.regs.r8,
            RegisterSlot::R9 => self.regs.r9,
            RegisterSlot::R10 => self.regs.r10,
        }
    }

    fn set_register(&mut self, which: RegisterSlot, value: u64) {
        let slot = match which {
            RegisterSlot::Rax => &mut self.regs.rax,
            RegisterSlot::Rbx => &mut self.regs.rbx,
            RegisterSlot::Rcx => &mut self.regs.rcx,
            RegisterSlot::Rdx => &mut self.regs.rdx,
            RegisterSlot::Rsi => &mut self.regs.rsi,
            RegisterSlot::Rdi => &mut self.regs.rdi,
            RegisterSlot::Rbp => &mut self.regs.rbp,
            RegisterSlot::R8 => &mut self.regs.r8,
            RegisterSlot::R9 => &mut self.regs.r9,
            RegisterSlot::R10 => &mut self.regs.r10,
        };
        *slot = value;
    }
}

/// Identity of the guest process that issued the call (spec §3). `cr3`
/// uniquely identifies a process for the duration it exists; constructed
/// lazily by the Backend on first sighting, then cached.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Process {
    pub cr3: u64,
    pub descriptor_addr: u64,
    pub pid: i32,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_pid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iswow64: Option<bool>,
}

#[derive(Copy, Clone, Debug)]
enum RegisterSlot {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    R8,
    R9,
    R10,
}

#[derive(Copy, Clone, Debug)]
enum ArgSlot {
    Register(RegisterSlot),
    /// Offset in argument-sized units from `rsp`, per spec §4.5's memory
    /// convention (Windows stack arguments only).
    Memory(u64),
}

/// `(rcx, rdx, r8, r9, memory@5)`: Windows x64 `syscall` convention. Index
/// 5 is the magic constant from §9's open question 3 — the 32-byte home
/// space plus the return address pushed by `syscall` — preserved exactly,
/// never recomputed from a "nicer" formula.
const WINDOWS_SYSCALL_CONVENTION: &[ArgSlot] = &[
    ArgSlot::Register(RegisterSlot::Rcx),
    ArgSlot::Register(RegisterSlot::Rdx),
    ArgSlot::Register(RegisterSlot::R8),
    ArgSlot::Register(RegisterSlot::R9),
    ArgSlot::Memory(5),
];

const LINUX_SYSCALL_CONVENTION: &[ArgSlot] = &[
    ArgSlot::Register(RegisterSlot::Rdi),
    ArgSlot::Register(RegisterSlot::Rsi),
    ArgSlot::Register(RegisterSlot::Rdx),
    ArgSlot::Register(RegisterSlot::R10),
    ArgSlot::Register(RegisterSlot::R9),
    ArgSlot::Register(RegisterSlot::R8),
];

const LINUX_SYSENTER_CONVENTION: &[ArgSlot] = &[
    ArgSlot::Register(RegisterSlot::Rbx),
    ArgSlot::Register(RegisterSlot::Rcx),
    ArgSlot::Register(RegisterSlot::Rdx),
    ArgSlot::Register(RegisterSlot::Rsi),
    ArgSlot::Register(RegisterSlot::Rdi),
    ArgSlot::Register(RegisterSlot::Rbp),
];

fn convention(os: OsType, kind: Kind) -> &'static [ArgSlot] {
    match (os, kind) {
        (OsType::Windows, _) => WINDOWS_SYSCALL_CONVENTION,
        (OsType::Linux, Kind::Syscall) => LINUX_SYSCALL_CONVENTION,
        (OsType::Linux, Kind::Sysenter) => LINUX_SYSENTER_CONVENTION,
    }
}

/// Fixed-width slot size for memory-based arguments: 8 bytes (`P`) on the
/// 64-bit `syscall` path, 4 bytes (`I`) on 32-bit `sysenter` (spec §4.5).
fn arg_size(kind: Kind) -> usize {
    match kind {
        Kind::Syscall => 8,
        Kind::Sysenter => 4,
    }
}

fn resolve_slot(os: OsType, kind: Kind, index: usize) -> Result<ArgSlot> {
    let table = convention(os, kind);
    if let Some(slot) = table.get(index) {
        return Ok(*slot);
    }
    // Windows spills past its last named convention entry into more stack
    // slots, each one argument-size further out (§4.5: "i >= 4 -> memory at
    // rsp + (5 + (i-4))*8"). Linux syscalls are limited to 6 parameters and
    // have no such overflow path.
    match table.last() {
        Some(ArgSlot::Memory(base)) => {
            let extra = (index - table.len() + 1) as u64;
            Ok(ArgSlot::Memory(base + extra - 1))
        }
        _ => Err(NitroError::HookDispatchError(format!(
            "argument index {} out of range for this calling convention",
            index
        ))),
    }
}

/// A view over an entry event's arguments, by ABI (spec §4.5). Reads on
/// EXIT expose only `rax` as argument 0 (return value) — callers build a
/// separate `ArgumentMap` for that case via `ArgumentMap::for_exit`.
pub struct ArgumentMap<'a> {
    os: OsType,
    kind: Kind,
    event: RawEvent,
    pid: i32,
    view: &'a dyn MemoryView,
    modified: HashMap<usize, u64>,
    exit_only: bool,
}

impl<'a> ArgumentMap<'a> {
    pub fn for_entry(os: OsType, event: RawEvent, pid: i32, view: &'a dyn MemoryView) -> Self {
        ArgumentMap {
            os,
            kind: event.kind,
            event,
            pid,
            view,
            modified: HashMap::new(),
            exit_only: false,
        }
    }

    pub fn for_exit(event: RawEvent, pid: i32, view: &'a dyn MemoryView) -> Self {
        ArgumentMap {
            os: OsType::Linux, // unused on the exit_only path
            kind: event.kind,
            event,
            pid,
            view,
            modified: HashMap::new(),
            exit_only: true,
        }
    }

    pub fn get(&self, index: usize) -> Result<u64> {
        if self.exit_only {
            return if index == 0 {
                Ok(self.event.regs.rax)
            } else {
                Err(NitroError::HookDispatchError(
                    "only argument 0 (return value) is readable on EXIT".into(),
                ))
            };
        }
        match resolve_slot(self.os, self.kind, index)? {
            ArgSlot::Register(r) => Ok(self.event.register(r)),
            ArgSlot::Memory(opaque) => self.read_memory_slot(opaque),
        }
    }

    pub fn set(&mut self, index: usize, value: u64) -> Result<()> {
        if self.exit_only {
            if index == 0 {
                self.event.regs.rax = value;
                self.modified.insert(0, value);
                return Ok(());
            }
            return Err(NitroError::HookDispatchError(
                "only argument 0 (return value) is writable on EXIT".into(),
            ));
        }
        match resolve_slot(self.os, self.kind, index)? {
            ArgSlot::Register(r) => self.event.set_register(r, value),
            ArgSlot::Memory(opaque) => self.write_memory_slot(opaque, value)?,
        }
        self.modified.insert(index, value);
        Ok(())
    }

    pub fn modified(&self) -> &HashMap<usize, u64> {
        &self.modified
    }

    pub fn regs(&self) -> &Regs {
        &self.event.regs
    }

    /// The event this map was built from, with any register writes made
    /// through `set()` already applied — the Backend reads this back after
    /// hook dispatch to update the record (and, eventually, the VCPU).
    pub fn event(&self) -> RawEvent {
        self.event
    }

    fn slot_addr(&self, opaque: u64) -> u64 {
        self.event.regs.rsp + opaque * (arg_size(self.kind) as u64)
    }

    fn read_memory_slot(&self, opaque: u64) -> Result<u64> {
        let addr = self.slot_addr(opaque);
        let size = arg_size(self.kind);
        let bytes = self.view.read_bytes(addr, self.pid, size)?;
        Ok(match size {
            4 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&bytes);
                u32::from_le_bytes(buf) as u64
            }
            _ => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                u64::from_le_bytes(buf)
            }
        })
    }

    fn write_memory_slot(&self, opaque: u64, value: u64) -> Result<()> {
        let addr = self.slot_addr(opaque);
        let size = arg_size(self.kind);
        let bytes = if size == 4 {
            (value as u32).to_le_bytes().to_vec()
        } else {
            value.to_le_bytes().to_vec()
        };
        self.view.write_bytes(addr, self.pid, &bytes)
    }
}

/// Produced by C4 (spec §3). `hook_payload` is `Option<serde_json::Value>`
/// so hook code can attach arbitrary structured data without the crate
/// needing to know hook-specific types.
pub struct SyscallRecord {
    pub event: RawEvent,
    pub full_name: String,
    pub name: String,
    pub process: Option<Process>,
    pub hook_payload: Option<serde_json::Value>,
    pub modified: HashMap<usize, u64>,
}

impl SyscallRecord {
    pub fn unknown(event: RawEvent, process: Option<Process>) -> Self {
        SyscallRecord {
            event,
            full_name: "Unknown".to_string(),
            name: "Unknown".to_string(),
            process,
            hook_payload: None,
            modified: HashMap::new(),
        }
    }
}

/// Handler-name cleaning (spec §4.4): Windows takes the substring after
/// `!`; Linux strips a `SyS_`/`sys_` prefix if present, else passes through
/// unchanged.
pub fn clean_name(os: OsType, full_name: &str) -> String {
    match os {
        OsType::Windows => full_name
            .rsplit('!')
            .next()
            .unwrap_or(full_name)
            .to_string(),
        OsType::Linux => full_name
            .strip_prefix("SyS_")
            .or_else(|| full_name.strip_prefix("sys_"))
            .unwrap_or(full_name)
            .to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::test_double::NullMemoryView;

    fn sample_event(kind: Kind) -> RawEvent {
        let mut regs = Regs::default();
        regs.rcx = 11;
        regs.rdx = 22;
        regs.r8 = 33;
        regs.r9 = 44;
        regs.rsp = 0x2000;
        RawEvent {
            direction: Direction::Enter,
            kind,
            regs,
            sregs: SRegs::default(),
            vcpu_index: 0,
        }
    }

    #[test]
    fn windows_register_args_resolve_by_convention() {
        let view = NullMemoryView::new(OsType::Windows);
        let map = ArgumentMap::for_entry(OsType::Windows, sample_event(Kind::Syscall), 7, &view);
        assert_eq!(map.get(0).unwrap(), 11);
        assert_eq!(map.get(1).unwrap(), 22);
        assert_eq!(map.get(2).unwrap(), 33);
        assert_eq!(map.get(3).unwrap(), 44);
    }

    #[test]
    fn windows_stack_argument_uses_magic_slot_five() {
        let view = NullMemoryView::new(OsType::Windows).with_memory(
            0x2000 + 5 * 8,
            7,
            99u64.to_le_bytes().to_vec(),
        );
        let map = ArgumentMap::for_entry(OsType::Windows, sample_event(Kind::Syscall), 7, &view);
        assert_eq!(map.get(4).unwrap(), 99);
    }

    #[test]
    fn windows_stack_argument_beyond_five_walks_forward_one_slot_at_a_time() {
        let view = NullMemoryView::new(OsType::Windows).with_memory(
            0x2000 + 6 * 8,
            7,
            7u64.to_le_bytes().to_vec(),
        );
        let map = ArgumentMap::for_entry(OsType::Windows, sample_event(Kind::Syscall), 7, &view);
        assert_eq!(map.get(5).unwrap(), 7);
    }

    #[test]
    fn argument_round_trip_write_then_read() {
        let view = NullMemoryView::new(OsType::Linux);
        let mut map = ArgumentMap::for_entry(OsType::Linux, sample_event(Kind::Syscall), 7, &view);
        map.set(0, 123).unwrap();
        assert_eq!(map.get(0).unwrap(), 123);
        assert_eq!(*map.modified().get(&0).unwrap(), 123);
    }

    #[test]
    fn exit_args_expose_only_return_value() {
        let view = NullMemoryView::new(OsType::Linux);
        let map = ArgumentMap::for_exit(sample_event(Kind::Syscall), 7, &view);
        assert!(map.get(0).is_ok());
        assert!(map.get(1).is_err());
    }

    #[test]
    fn linux_name_cleaning_strips_sys_prefix() {
        assert_eq!(clean_name(OsType::Linux, "SyS_open"), "open");
        assert_eq!(clean_name(OsType::Linux, "sys_write"), "write");
        assert_eq!(clean_name(OsType::Linux, "do_something_else"), "do_something_else");
    }

    #[test]
    fn windows_name_cleaning_takes_substring_after_bang() {
        assert_eq!(clean_name(OsType::Windows, "nt!NtOpenKey"), "NtOpenKey");
    }
}
