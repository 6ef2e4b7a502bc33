//! C1: thin wrapper over the modified hypervisor's control interface.
//!
//! Unlike the teacher's `Hypervisor` (which injects syscalls into a remote
//! QEMU process via ptrace because it talks to a stock, unmodified KVM), a
//! Nitro driver issues ioctls directly against `/dev/kvm` and the fds it
//! hands back — the modified hypervisor exposes the Nitro protocol to any
//! process holding those fds, no injection required.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};

use log::{debug, info};
use nix::unistd::Pid;

use super::{
    Direction, Kind, NitroEventStr, NitroVcpus, Regs, SRegs, KVM_NITRO_ADD_SYSCALL_FILTER,
    KVM_NITRO_ATTACH_VCPUS, KVM_NITRO_ATTACH_VM, KVM_NITRO_CONTINUE, KVM_NITRO_GET_EVENT,
    KVM_NITRO_GET_REGS, KVM_NITRO_GET_SREGS, KVM_NITRO_REMOVE_SYSCALL_FILTER,
    KVM_NITRO_SET_REGS, KVM_NITRO_SET_SREGS, KVM_NITRO_SET_SYSCALL_TRAP, NITRO_MAX_VCPUS,
};
use crate::error::{NitroError, Result};
use crate::syscall::RawEvent;

const KVM_NODE: &str = "/dev/kvm";
const LIBVIRT_PIDFILE_DIR: &str = "/var/run/libvirt/qemu";

/// Issue an ioctl on `fd`, translating a negative return into a
/// `VcpuIoFailed`/`AttachFailed`-flavored `nix::Error` via errno.
unsafe fn checked_ioctl(fd: RawFd, request: std::os::raw::c_ulong, arg: *mut libc::c_void) -> Result<i32> {
    let ret = libc::ioctl(fd, request as libc::c_ulong, arg);
    if ret < 0 {
        return Err(NitroError::VcpuIoFailed(nix::Error::last()));
    }
    Ok(ret)
}

pub struct KvmDriver {
    file: File,
}

impl KvmDriver {
    pub fn open() -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(KVM_NODE)
            .map_err(NitroError::Io)?;
        Ok(Self { file })
    }

    /// `examples/original_source/nitro/listener.py::find_qemu_pid` — pidfile
    /// first, process-table scan as fallback.
    pub fn find_qemu_pid(domain_name: &str) -> Result<Pid> {
        let pidfile = format!("{}/{}.pid", LIBVIRT_PIDFILE_DIR, domain_name);
        if let Ok(content) = std::fs::read_to_string(&pidfile) {
            if let Ok(raw) = content.trim().parse::<i32>() {
                debug!("found qemu pid {} via {}", raw, pidfile);
                return Ok(Pid::from_raw(raw));
            }
        }

        for entry in std::fs::read_dir("/proc").map_err(NitroError::Io)? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let pid: i32 = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                Some(pid) => pid,
                None => continue,
            };
            let cmdline_path = entry.path().join("cmdline");
            let cmdline = match std::fs::read(&cmdline_path) {
                Ok(c) => c,
                Err(_) => continue,
            };
            let args: Vec<&str> = cmdline
                .split(|&b| b == 0)
                .filter(|s| !s.is_empty())
                .map(|s| std::str::from_utf8(s).unwrap_or(""))
                .collect();
            if args.is_empty() || !args[0].ends_with("qemu-system-x86_64") {
                continue;
            }
            let matched = args
                .windows(2)
                .any(|w| w[0] == "-name" && w[1].contains(domain_name));
            if matched {
                debug!("found qemu pid {} by scanning /proc", pid);
                return Ok(Pid::from_raw(pid));
            }
        }

        Err(NitroError::HypervisorNotFound(domain_name.to_string()))
    }

    /// `attach(qemu_pid) -> VmHandle` (spec §4.1). The ioctl's return value
    /// is itself the newly-created VM fd, matching
    /// `nitro/kvm.py::KVM.attach_vm`.
    pub fn attach(&self, pid: Pid) -> Result<VmHandle> {
        info!("attaching to hypervisor process {}", pid);
        let mut raw_pid: i32 = pid.as_raw();
        let vm_fd = unsafe {
            checked_ioctl(
                self.file.as_raw_fd(),
                KVM_NITRO_ATTACH_VM(),
                &mut raw_pid as *mut i32 as *mut libc::c_void,
            )
            .map_err(|_| NitroError::AttachFailed {
                pid,
                source: std::io::Error::last_os_error(),
            })?
        };
        Ok(VmHandle {
            fd: vm_fd,
            active_filters: HashSet::new(),
        })
    }
}

/// Per-VM handle: arm/disarm the global trap, enumerate VCPUs, maintain the
/// syscall filter (in-kernel plus the host-side mirror of §9's open
/// question 4).
pub struct VmHandle {
    fd: RawFd,
    active_filters: HashSet<u32>,
}

impl VmHandle {
    pub fn attach_vcpus(&self) -> Result<Vec<VcpuHandle>> {
        let mut vcpus = NitroVcpus {
            num_vcpus: 0,
            ids: [0; NITRO_MAX_VCPUS],
            fds: [0; NITRO_MAX_VCPUS],
        };
        unsafe {
            checked_ioctl(
                self.fd,
                KVM_NITRO_ATTACH_VCPUS(),
                &mut vcpus as *mut NitroVcpus as *mut libc::c_void,
            )?;
        }
        let n = vcpus.num_vcpus as usize;
        info!("attached {} vcpus", n);
        Ok((0..n)
            .map(|i| VcpuHandle {
                fd: vcpus.fds[i],
                index: vcpus.ids[i] as u32,
            })
            .collect())
    }

    /// Ordering (domain→pause; trap→toggle; domain→resume) is the caller's
    /// responsibility (spec §4.1/§5); this method only performs the middle
    /// step.
    pub fn set_syscall_trap(&self, enabled: bool) -> Result<()> {
        let mut flag = enabled;
        unsafe {
            checked_ioctl(
                self.fd,
                KVM_NITRO_SET_SYSCALL_TRAP(),
                &mut flag as *mut bool as *mut libc::c_void,
            )?;
        }
        Ok(())
    }

    pub fn add_syscall_filter(&mut self, selector: u32) -> Result<()> {
        let mut arg: u64 = selector as u64;
        unsafe {
            checked_ioctl(
                self.fd,
                KVM_NITRO_ADD_SYSCALL_FILTER(),
                &mut arg as *mut u64 as *mut libc::c_void,
            )?;
        }
        self.active_filters.insert(selector);
        Ok(())
    }

    pub fn remove_syscall_filter(&mut self, selector: u32) -> Result<()> {
        let mut arg: u64 = selector as u64;
        unsafe {
            checked_ioctl(
                self.fd,
                KVM_NITRO_REMOVE_SYSCALL_FILTER(),
                &mut arg as *mut u64 as *mut libc::c_void,
            )?;
        }
        self.active_filters.remove(&selector);
        Ok(())
    }

    /// Host-side mirror of the filter set (§9 open question 4): lets
    /// introspection of "what is filtered" happen without a round-trip to
    /// the hypervisor.
    pub fn active_filters(&self) -> &HashSet<u32> {
        &self.active_filters
    }
}

impl Drop for VmHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

pub struct VcpuHandle {
    fd: RawFd,
    index: u32,
}

impl VcpuHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Returns `Ok(None)` when the hypervisor's poll timed out with no
    /// matching event (§9 open question 2: treated as success, not error).
    pub fn get_event(&self) -> Result<Option<RawEvent>> {
        let mut raw = NitroEventStr::default();
        unsafe {
            checked_ioctl(
                self.fd,
                KVM_NITRO_GET_EVENT(),
                &mut raw as *mut NitroEventStr as *mut libc::c_void,
            )?;
        }
        if !raw.present {
            return Ok(None);
        }
        let direction = if raw.direction == Direction::Exit as u32 {
            Direction::Exit
        } else {
            Direction::Enter
        };
        let kind = if raw.kind == Kind::Syscall as u32 {
            Kind::Syscall
        } else {
            Kind::Sysenter
        };
        Ok(Some(RawEvent {
            direction,
            kind,
            regs: raw.regs,
            sregs: raw.sregs,
            vcpu_index: self.index,
        }))
    }

    pub fn get_regs(&self) -> Result<Regs> {
        let mut regs = Regs::default();
        unsafe {
            checked_ioctl(
                self.fd,
                KVM_NITRO_GET_REGS(),
                &mut regs as *mut Regs as *mut libc::c_void,
            )?;
        }
        Ok(regs)
    }

    pub fn set_regs(&self, regs: &Regs) -> Result<()> {
        let mut wire = *regs;
        unsafe {
            checked_ioctl(
                self.fd,
                KVM_NITRO_SET_REGS(),
                &mut wire as *mut Regs as *mut libc::c_void,
            )?;
        }
        Ok(())
    }

    pub fn get_sregs(&self) -> Result<SRegs> {
        let mut sregs = SRegs::default();
        unsafe {
            checked_ioctl(
                self.fd,
                KVM_NITRO_GET_SREGS(),
                &mut sregs as *mut SRegs as *mut libc::c_void,
            )?;
        }
        Ok(sregs)
    }

    pub fn set_sregs(&self, sregs: &SRegs) -> Result<()> {
        let mut sregs = *sregs;
        unsafe {
            checked_ioctl(
                self.fd,
                KVM_NITRO_SET_SREGS(),
                &mut sregs as *mut SRegs as *mut libc::c_void,
            )?;
        }
        Ok(())
    }

    pub fn continue_vm(&self) -> Result<()> {
        unsafe {
            checked_ioctl(self.fd, KVM_NITRO_CONTINUE(), std::ptr::null_mut())?;
        }
        Ok(())
    }
}

impl Drop for VcpuHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn find_qemu_pid_reports_hypervisor_not_found_for_bogus_domain() {
        let err = KvmDriver::find_qemu_pid("definitely-not-a-real-domain-xyz");
        assert!(matches!(err, Err(NitroError::HypervisorNotFound(_))));
    }
}
