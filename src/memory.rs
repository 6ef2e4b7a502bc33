//! C3: Memory View — a capability surface over the introspection library,
//! not an implementation. Spec §4.3/§6 enumerate the operations; the
//! teacher has no equivalent (it talks to one concrete VM's memory
//! directly via `GuestMem`), so this is modeled as a trait object the
//! Backend and hook callbacks are handed, following the same
//! trait-at-the-seam style as `loks0n-carbon`'s `IoHandler`/`MmioHandler`.

use crate::error::Result;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OsType {
    Windows,
    Linux,
}

/// Injected into the Backend and into hook callbacks. All reads/writes fail
/// with `NitroError::MemoryAccessError` on nullptr, paging failure, or a
/// short read — never panic.
pub trait MemoryView: Send + Sync {
    fn os_type(&self) -> OsType;

    fn ksym_to_vaddr(&self, symbol: &str) -> Result<u64>;
    fn vaddr_to_ksym(&self, vaddr: u64) -> Result<String>;
    fn kvaddr_to_paddr(&self, vaddr: u64) -> Result<u64>;

    fn read_addr_va(&self, va: u64, pid: i32) -> Result<u64>;
    fn read_u32(&self, va: u64, pid: i32) -> Result<u32>;
    fn read_str_va(&self, va: u64, pid: i32) -> Result<String>;
    fn read_bytes(&self, va: u64, pid: i32, n: usize) -> Result<Vec<u8>>;
    fn write_bytes(&self, va: u64, pid: i32, buf: &[u8]) -> Result<()>;

    fn get_offset(&self, structure: &str, field: &str) -> Result<i64>;

    fn flush_v2p_cache(&self);
    fn flush_pid_cache(&self);
    fn flush_rva_cache(&self);
    fn flush_sym_cache(&self);
}

/// Flushes all four caches named in spec.md §4.3 in one call, the way
/// `process_event`'s step 1 needs it (§4.4).
pub fn flush_all_caches(view: &dyn MemoryView) {
    view.flush_v2p_cache();
    view.flush_pid_cache();
    view.flush_rva_cache();
    view.flush_sym_cache();
}

#[cfg(test)]
pub mod test_double {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// A `MemoryView` backed by plain maps, for the property suite (§8)
    /// and unit tests that don't need a live guest.
    pub struct NullMemoryView {
        pub os: OsType,
        pub symbols: HashMap<String, u64>,
        pub memory: Mutex<HashMap<(u64, i32), Vec<u8>>>,
        pub offsets: HashMap<(String, String), i64>,
        pub flushes: Mutex<Flushes>,
    }

    #[derive(Default, Debug, Clone, Copy)]
    pub struct Flushes {
        pub v2p: u32,
        pub pid: u32,
        pub rva: u32,
        pub sym: u32,
    }

    impl NullMemoryView {
        pub fn new(os: OsType) -> Self {
            NullMemoryView {
                os,
                symbols: HashMap::new(),
                memory: Mutex::new(HashMap::new()),
                offsets: HashMap::new(),
                flushes: Mutex::new(Flushes::default()),
            }
        }

        pub fn with_memory(mut self, va: u64, pid: i32, bytes: Vec<u8>) -> Self {
            self.memory.lock().unwrap().insert((va, pid), bytes);
            self
        }
    }

    impl MemoryView for NullMemoryView {
        fn os_type(&self) -> OsType {
            self.os
        }

        fn ksym_to_vaddr(&self, symbol: &str) -> Result<u64> {
            self.symbols
                .get(symbol)
                .copied()
                .ok_or_else(|| crate::error::NitroError::MemoryAccessError {
                    addr: 0,
                    pid: -1,
                    reason: format!("unknown symbol {}", symbol),
                })
        }

        fn vaddr_to_ksym(&self, vaddr: u64) -> Result<String> {
            self.symbols
                .iter()
                .find(|(_, v)| **v == vaddr)
                .map(|(k, _)| k.clone())
                .ok_or_else(|| crate::error::NitroError::MemoryAccessError {
                    addr: vaddr,
                    pid: -1,
                    reason: "no symbol at address".into(),
                })
        }

        fn kvaddr_to_paddr(&self, vaddr: u64) -> Result<u64> {
            Ok(vaddr)
        }

        fn read_addr_va(&self, va: u64, pid: i32) -> Result<u64> {
            let bytes = self.read_bytes(va, pid, 8)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes);
            Ok(u64::from_le_bytes(buf))
        }

        fn read_u32(&self, va: u64, pid: i32) -> Result<u32> {
            let bytes = self.read_bytes(va, pid, 4)?;
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes);
            Ok(u32::from_le_bytes(buf))
        }

        fn read_str_va(&self, va: u64, pid: i32) -> Result<String> {
            let guard = self.memory.lock().unwrap();
            let bytes = guard.get(&(va, pid)).ok_or_else(|| {
                crate::error::NitroError::MemoryAccessError {
                    addr: va,
                    pid,
                    reason: "no mapping".into(),
                }
            })?;
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
        }

        fn read_bytes(&self, va: u64, pid: i32, n: usize) -> Result<Vec<u8>> {
            let guard = self.memory.lock().unwrap();
            let bytes = guard.get(&(va, pid)).ok_or_else(|| {
                crate::error::NitroError::MemoryAccessError {
                    addr: va,
                    pid,
                    reason: "no mapping".into(),
                }
            })?;
            if bytes.len() < n {
                return Err(crate::error::NitroError::MemoryAccessError {
                    addr: va,
                    pid,
                    reason: "short read".into(),
                });
            }
            Ok(bytes[..n].to_vec())
        }

        fn write_bytes(&self, va: u64, pid: i32, buf: &[u8]) -> Result<()> {
            self.memory
                .lock()
                .unwrap()
                .insert((va, pid), buf.to_vec());
            Ok(())
        }

        fn get_offset(&self, structure: &str, field: &str) -> Result<i64> {
            self.offsets
                .get(&(structure.to_string(), field.to_string()))
                .copied()
                .ok_or_else(|| crate::error::NitroError::IntrospectionFailure(format!(
                    "no offset for {}.{}",
                    structure, field
                )))
        }

        fn flush_v2p_cache(&self) {
            self.flushes.lock().unwrap().v2p += 1;
        }
        fn flush_pid_cache(&self) {
            self.flushes.lock().unwrap().pid += 1;
        }
        fn flush_rva_cache(&self) {
            self.flushes.lock().unwrap().rva += 1;
        }
        fn flush_sym_cache(&self) {
            self.flushes.lock().unwrap().sym += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::test_double::NullMemoryView;
    use super::*;

    #[test]
    fn argument_round_trip_through_memory_view() {
        let view = NullMemoryView::new(OsType::Windows);
        view.write_bytes(0x1000, 42, &8u64.to_le_bytes()).unwrap();
        assert_eq!(view.read_addr_va(0x1000, 42).unwrap(), 8);
        view.write_bytes(0x1000, 42, &9u64.to_le_bytes()).unwrap();
        assert_eq!(view.read_addr_va(0x1000, 42).unwrap(), 9);
    }

    #[test]
    fn flush_all_caches_touches_all_four_counters() {
        let view = NullMemoryView::new(OsType::Linux);
        flush_all_caches(&view);
        let f = view.flushes.lock().unwrap();
        assert_eq!((f.v2p, f.pid, f.rva, f.sym), (1, 1, 1, 1));
    }
}
