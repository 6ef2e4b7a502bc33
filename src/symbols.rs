//! Symbol-bundle JSON schema (spec §6) and the `SdtTable` built from it.
//!
//! The bundle is produced by an external collaborator (the physical-memory
//! symbol extraction tool, out of scope per spec §1) and handed to Nitro
//! whole; parse errors here are fatal at startup (spec §7).

use std::collections::HashMap;

use log::debug;
use serde::Deserialize;

use crate::error::{NitroError, Result};

#[derive(Debug, Deserialize)]
pub struct SymbolBundle {
    pub syscall_table: Vec<SyscallTableEntry>,
    pub offsets: HashMap<String, HashMap<String, i64>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SyscallTableEntry {
    Divider { divider: String },
    Entry { entry: u32, symbol: SymbolRef },
}

#[derive(Debug, Deserialize)]
pub struct SymbolRef {
    pub symbol: String,
}

impl SymbolBundle {
    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(NitroError::SymbolBundleInvalid)
    }

    pub fn get_offset(&self, structure: &str, field: &str) -> Result<i64> {
        self.offsets
            .get(structure)
            .and_then(|fields| fields.get(field))
            .copied()
            .ok_or_else(|| {
                NitroError::IntrospectionFailure(format!(
                    "symbol bundle has no offset for {}.{}",
                    structure, field
                ))
            })
    }
}

/// Windows SSDT: two ordered tables indexed by SSN — entry 0 is `nt`,
/// entry 1 is `win32k` (spec §3). Built once, immutable thereafter.
#[derive(Debug, Default)]
pub struct SdtTable {
    tables: [HashMap<u32, String>; 2],
}

impl SdtTable {
    pub fn from_bundle(bundle: &SymbolBundle) -> Result<Self> {
        let mut tables: [HashMap<u32, String>; 2] = [HashMap::new(), HashMap::new()];
        let mut current: Option<usize> = None;
        for entry in &bundle.syscall_table {
            match entry {
                SyscallTableEntry::Divider { divider } => {
                    let idx = parse_divider_index(divider)?;
                    debug!("sdt divider: {} -> table {}", divider, idx);
                    current = Some(idx);
                }
                SyscallTableEntry::Entry { entry, symbol } => {
                    let idx = current.ok_or_else(|| {
                        NitroError::IntrospectionFailure(
                            "syscall_table entry before any divider".into(),
                        )
                    })?;
                    if idx < 2 {
                        tables[idx].insert(*entry, symbol.symbol.clone());
                    }
                }
            }
        }
        Ok(SdtTable { tables })
    }

    /// `sdt[(rax>>12)&3][rax&0xFFF]` (spec §3/§4.4). Tables 2 and 3 are
    /// always null on Windows; callers resolve those to `Table{n}!Unknown`
    /// themselves (see `introspect::windows`).
    pub fn lookup(&self, table: u32, ssn: u32) -> Option<&str> {
        self.tables
            .get(table as usize)
            .and_then(|t| t.get(&ssn))
            .map(|s| s.as_str())
    }

    /// Linear scan for the selector number of a (possibly dirty, `nt!`-
    /// prefixed) name — used by the hook dispatcher to compute a filter
    /// selector (spec §4.5).
    pub fn find_syscall_nb(&self, name: &str) -> Option<u32> {
        for (table_idx, table) in self.tables.iter().enumerate() {
            for (ssn, full_name) in table {
                if full_name == name || full_name.rsplit('!').next() == Some(name) {
                    return Some(((table_idx as u32) << 12) | ssn);
                }
            }
        }
        None
    }
}

fn parse_divider_index(divider: &str) -> Result<usize> {
    let rest = divider
        .strip_prefix("Table ")
        .ok_or_else(|| NitroError::IntrospectionFailure(format!("bad SDT divider: {}", divider)))?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits
        .parse::<usize>()
        .map_err(|_| NitroError::IntrospectionFailure(format!("bad SDT divider: {}", divider)))
}

/// Linux `SyscallNameMap`: handler name -> index in `sys_call_table`. Built
/// lazily (spec §3/§4.4) by reading table entries through the `MemoryView`
/// until a pointer fails to resolve to a kernel symbol, practical limit
/// ≈1024 entries.
#[derive(Debug, Default)]
pub struct SyscallNameMap {
    by_index: Vec<String>,
}

pub const LINUX_SYSCALL_TABLE_LIMIT: usize = 1024;

impl SyscallNameMap {
    pub fn build(
        view: &dyn crate::memory::MemoryView,
        sys_call_table: u64,
    ) -> Result<Self> {
        let mut by_index = Vec::new();
        for i in 0..LINUX_SYSCALL_TABLE_LIMIT {
            let entry_addr = sys_call_table + (i as u64) * 8;
            let ptr = match view.read_addr_va(entry_addr, 0) {
                Ok(p) => p,
                Err(_) => break,
            };
            match view.vaddr_to_ksym(ptr) {
                Ok(name) => by_index.push(name),
                Err(_) => break,
            }
        }
        Ok(SyscallNameMap { by_index })
    }

    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.by_index.get(index).map(|s| s.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.by_index.iter().position(|n| n == name).map(|i| i as u32)
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"{
        "syscall_table": [
            {"divider": "Table 0 @ 0xfffff80000000000"},
            {"entry": 0, "symbol": {"symbol": "nt!NtAccessCheck"}},
            {"entry": 17, "symbol": {"symbol": "nt!NtOpenKey"}},
            {"divider": "Table 1 @ 0xfffff80000001000"},
            {"entry": 0, "symbol": {"symbol": "win32k!NtUserMessageCall"}}
        ],
        "offsets": {
            "KPROCESS": {"DirectoryTableBase": 40}
        }
    }"#;

    #[test]
    fn parses_sample_bundle() {
        let bundle = SymbolBundle::from_json(SAMPLE).unwrap();
        assert_eq!(bundle.get_offset("KPROCESS", "DirectoryTableBase").unwrap(), 40);
    }

    #[test]
    fn sdt_lookup_resolves_nt_open_key() {
        let bundle = SymbolBundle::from_json(SAMPLE).unwrap();
        let sdt = SdtTable::from_bundle(&bundle).unwrap();
        assert_eq!(sdt.lookup(0, 17), Some("nt!NtOpenKey"));
        assert_eq!(sdt.lookup(1, 0), Some("win32k!NtUserMessageCall"));
        assert_eq!(sdt.lookup(0, 999), None);
    }

    #[test]
    fn find_syscall_nb_round_trips_with_lookup() {
        let bundle = SymbolBundle::from_json(SAMPLE).unwrap();
        let sdt = SdtTable::from_bundle(&bundle).unwrap();
        let selector = sdt.find_syscall_nb("NtOpenKey").unwrap();
        assert_eq!(selector, 17);
    }

    #[test]
    fn invalid_json_is_symbol_bundle_invalid() {
        let err = SymbolBundle::from_json("not json").unwrap_err();
        assert!(matches!(err, NitroError::SymbolBundleInvalid(_)));
    }
}
