//! Wire ABI for the modified hypervisor's Nitro control interface.
//!
//! Request codes below are specific to Nitro's hypervisor patch (it shares
//! the `KVMIO` type byte with stock KVM but occupies the unused `0xE1..0xEC`
//! range). The register snapshots it hands back are the *standard* KVM
//! ABI, so `Regs`/`SRegs` are reused straight from `kvm-bindings` rather
//! than hand-rolled — the teacher already depends on this crate for the
//! same reason.

pub mod driver;

use std::os::raw::c_uint;

use kvm_bindings as kvmb;

pub type Regs = kvmb::kvm_regs;
pub type SRegs = kvmb::kvm_sregs;

/// Expression that calculates an ioctl number. Borrowed from vmm-sys-util /
/// the Linux `<asm-generic/ioctl.h>` layout, since KVM's ioctl numbering
/// scheme is exactly that one.
macro_rules! ioctl_expr {
    ($dir:expr, $ty:expr, $nr:expr, $size:expr) => {
        (($dir << _IOC_DIRSHIFT)
            | ($ty << _IOC_TYPESHIFT)
            | ($nr << _IOC_NRSHIFT)
            | ($size << _IOC_SIZESHIFT)) as ::std::os::raw::c_ulong
    };
}

macro_rules! ioctl_ioc_nr {
    ($name:ident, $dir:expr, $ty:expr, $nr:expr, $size:expr) => {
        #[allow(non_snake_case)]
        #[allow(clippy::cast_lossless)]
        pub fn $name() -> ::std::os::raw::c_ulong {
            ioctl_expr!($dir, $ty, $nr, $size)
        }
    };
}

macro_rules! ioctl_io_nr {
    ($name:ident, $ty:expr, $nr:expr) => {
        ioctl_ioc_nr!($name, _IOC_NONE, $ty, $nr, 0);
    };
}

macro_rules! ioctl_iow_nr {
    ($name:ident, $ty:expr, $nr:expr, $size:ty) => {
        ioctl_ioc_nr!(
            $name,
            _IOC_WRITE,
            $ty,
            $nr,
            ::std::mem::size_of::<$size>() as u32
        );
    };
}

macro_rules! ioctl_ior_nr {
    ($name:ident, $ty:expr, $nr:expr, $size:ty) => {
        ioctl_ioc_nr!(
            $name,
            _IOC_READ,
            $ty,
            $nr,
            ::std::mem::size_of::<$size>() as u32
        );
    };
}

const _IOC_NRSHIFT: c_uint = 0;
const _IOC_TYPESHIFT: c_uint = 8;
const _IOC_SIZESHIFT: c_uint = 16;
const _IOC_DIRSHIFT: c_uint = 30;
const _IOC_NONE: c_uint = 0;
const _IOC_WRITE: c_uint = 1;
const _IOC_READ: c_uint = 2;

const KVMIO: c_uint = 0xAE;

pub const NITRO_MAX_VCPUS: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Direction {
    Enter = 0,
    Exit = 1,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Kind {
    Sysenter = 0,
    Syscall = 1,
}

/// Wire layout of the `GET_EVENT` payload (spec §6). `present == false`
/// means the poll timed out with no event — not an error (§9 open
/// question 2).
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct NitroEventStr {
    pub present: bool,
    pub direction: u32,
    pub kind: u32,
    pub regs: Regs,
    pub sregs: SRegs,
}

impl Default for NitroEventStr {
    fn default() -> Self {
        NitroEventStr {
            present: false,
            direction: 0,
            kind: 0,
            regs: Regs::default(),
            sregs: SRegs::default(),
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct NitroVcpus {
    pub num_vcpus: i32,
    pub ids: [i32; NITRO_MAX_VCPUS],
    pub fds: [i32; NITRO_MAX_VCPUS],
}

impl Default for NitroVcpus {
    fn default() -> Self {
        NitroVcpus {
            num_vcpus: 0,
            ids: [0; NITRO_MAX_VCPUS],
            fds: [0; NITRO_MAX_VCPUS],
        }
    }
}

ioctl_iow_nr!(KVM_NITRO_ATTACH_VM, KVMIO, 0xE1, i32);
ioctl_ior_nr!(KVM_NITRO_ATTACH_VCPUS, KVMIO, 0xE2, NitroVcpus);
ioctl_iow_nr!(KVM_NITRO_SET_SYSCALL_TRAP, KVMIO, 0xE3, bool);
ioctl_ior_nr!(KVM_NITRO_GET_EVENT, KVMIO, 0xE5, NitroEventStr);
ioctl_io_nr!(KVM_NITRO_CONTINUE, KVMIO, 0xE6);
ioctl_ior_nr!(KVM_NITRO_GET_REGS, KVMIO, 0xE7, Regs);
ioctl_iow_nr!(KVM_NITRO_SET_REGS, KVMIO, 0xE8, Regs);
ioctl_ior_nr!(KVM_NITRO_GET_SREGS, KVMIO, 0xE9, SRegs);
ioctl_iow_nr!(KVM_NITRO_SET_SREGS, KVMIO, 0xEA, SRegs);
ioctl_ior_nr!(KVM_NITRO_ADD_SYSCALL_FILTER, KVMIO, 0xEB, u64);
ioctl_ior_nr!(KVM_NITRO_REMOVE_SYSCALL_FILTER, KVMIO, 0xEC, u64);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn attach_vm_request_code_matches_wire_contract() {
        // IOW(KVMIO, 0xE1, c_int) with KVMIO=0xAE, dir=write(1), size=4.
        let expected = (1u64 << 30) | (0xAEu64 << 8) | (0xE1u64) | ((4u64) << 16);
        assert_eq!(KVM_NITRO_ATTACH_VM() as u64, expected);
    }

    #[test]
    fn continue_is_a_bare_io_request() {
        let expected = (0xAEu64 << 8) | 0xE6u64;
        assert_eq!(KVM_NITRO_CONTINUE() as u64, expected);
    }

    #[test]
    fn regs_snapshot_has_eighteen_general_registers() {
        assert_eq!(std::mem::size_of::<Regs>(), 18 * 8);
    }
}
