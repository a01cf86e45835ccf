//! SEV command payloads and the KVM-backed [`SevFirmware`].
//!
//! Payload layouts follow `struct kvm_sev_*` in `linux/kvm.h` and
//! `struct sev_*` in `linux/psp-sev.h`.  Buffers are passed to the kernel
//! as host virtual addresses; guest memory addresses are translated and
//! bounds-checked through [`GuestMemoryManager::host_range`].

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;

use kvm_bindings::kvm_sev_cmd;
use kvm_ioctls::VmFd;
use log::{debug, info};
use vmm_sys_util::ioctl::ioctl_with_mut_ref;
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iowr_nr};

use super::{len32, GuestStatus, SevCommand, SevError, SevFirmware, TransferLengths};
use crate::certs::TransportCertificates;
use crate::memory::GuestMemoryManager;

/// Path of the SEV platform device.
pub const SEV_DEVICE_PATH: &str = "/dev/sev";

// ═══════════════════════════════════════════════════════════════════════
//  /dev/sev
// ═══════════════════════════════════════════════════════════════════════

const SEV_IOC_TYPE: u32 = b'S' as u32;

/// `SEV_PLATFORM_STATUS` command of `SEV_ISSUE_CMD`.
const SEV_PLATFORM_STATUS: u32 = 1;

#[repr(C, packed)]
struct SevIssueCmd {
    cmd: u32,
    data: u64,
    error: u32,
}

#[repr(C, packed)]
#[derive(Default)]
struct SevUserDataStatus {
    api_major: u8,
    api_minor: u8,
    state: u8,
    flags: u32,
    build: u8,
    guest_count: u32,
}

const _: () = assert!(std::mem::size_of::<SevIssueCmd>() == 16);
const _: () = assert!(std::mem::size_of::<SevUserDataStatus>() == 12);

ioctl_iowr_nr!(SEV_ISSUE_CMD, SEV_IOC_TYPE, 0x0, SevIssueCmd);

/// Platform-wide SEV firmware status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformStatus {
    pub api_major: u8,
    pub api_minor: u8,
    pub state: u8,
    pub flags: u32,
    pub build: u8,
    pub guest_count: u32,
}

impl PlatformStatus {
    pub fn state_name(&self) -> &'static str {
        match self.state {
            0 => "UNINIT",
            1 => "INIT",
            2 => "WORKING",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for PlatformStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "api {}.{} build {}, state {} ({}), {} guests, flags {:#x}",
            self.api_major,
            self.api_minor,
            self.build,
            self.state,
            self.state_name(),
            self.guest_count,
            self.flags
        )
    }
}

/// Open handle on the SEV platform device.
///
/// The fd is passed along with every `KVM_MEMORY_ENCRYPT_OP` so KVM can
/// prove the caller may talk to the firmware.
pub struct SevDevice {
    file: File,
}

impl SevDevice {
    pub fn open() -> Result<Self, SevError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(SEV_DEVICE_PATH)
            .map_err(|source| SevError::DeviceOpen {
                path: SEV_DEVICE_PATH,
                source,
            })?;
        info!("Opened {SEV_DEVICE_PATH}");
        Ok(Self { file })
    }

    pub fn fd(&self) -> u32 {
        self.file.as_raw_fd() as u32
    }

    pub fn platform_status(&self) -> Result<PlatformStatus, SevError> {
        let mut status = SevUserDataStatus::default();
        let mut cmd = SevIssueCmd {
            cmd: SEV_PLATFORM_STATUS,
            data: &mut status as *mut SevUserDataStatus as u64,
            error: 0,
        };

        // SAFETY: `cmd` and the status buffer it points to outlive the
        // call and have the layout the driver expects.
        let ret = unsafe { ioctl_with_mut_ref(&self.file, SEV_ISSUE_CMD(), &mut cmd) };
        if ret < 0 {
            let source = io::Error::last_os_error();
            return Err(SevError::PlatformStatus {
                fw_error: cmd.error,
                source,
            });
        }

        Ok(PlatformStatus {
            api_major: status.api_major,
            api_minor: status.api_minor,
            state: status.state,
            flags: status.flags,
            build: status.build,
            guest_count: status.guest_count,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  KVM_MEMORY_ENCRYPT_OP payloads
// ═══════════════════════════════════════════════════════════════════════

#[repr(C)]
#[derive(Debug, Default)]
struct LaunchStart {
    handle: u32,
    policy: u32,
    dh_uaddr: u64,
    dh_len: u32,
    session_uaddr: u64,
    session_len: u32,
}

/// Shared shape of `kvm_sev_launch_update_data` and
/// `kvm_sev_launch_measure`.
#[repr(C)]
#[derive(Debug, Default)]
struct AddressLength {
    uaddr: u64,
    len: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct GuestStatusPayload {
    handle: u32,
    policy: u32,
    state: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct Dbg {
    src_uaddr: u64,
    dst_uaddr: u64,
    len: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct SendStart {
    policy: u32,
    pdh_cert_uaddr: u64,
    pdh_cert_len: u32,
    plat_certs_uaddr: u64,
    plat_certs_len: u32,
    amd_certs_uaddr: u64,
    amd_certs_len: u32,
    session_uaddr: u64,
    session_len: u32,
}

/// Shared shape of `kvm_sev_send_update_data` and
/// `kvm_sev_receive_update_data`.
#[repr(C)]
#[derive(Debug, Default)]
struct UpdateData {
    hdr_uaddr: u64,
    hdr_len: u32,
    guest_uaddr: u64,
    guest_len: u32,
    trans_uaddr: u64,
    trans_len: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct ReceiveStart {
    handle: u32,
    policy: u32,
    pdh_uaddr: u64,
    pdh_len: u32,
    session_uaddr: u64,
    session_len: u32,
}

const _: () = assert!(std::mem::size_of::<LaunchStart>() == 40);
const _: () = assert!(std::mem::size_of::<AddressLength>() == 16);
const _: () = assert!(std::mem::size_of::<GuestStatusPayload>() == 12);
const _: () = assert!(std::mem::size_of::<Dbg>() == 24);
const _: () = assert!(std::mem::size_of::<SendStart>() == 72);
const _: () = assert!(std::mem::size_of::<UpdateData>() == 48);
const _: () = assert!(std::mem::size_of::<ReceiveStart>() == 40);

// ═══════════════════════════════════════════════════════════════════════
//  KvmSev
// ═══════════════════════════════════════════════════════════════════════

/// [`SevFirmware`] over a KVM VM fd and an open [`SevDevice`].
pub struct KvmSev<'a> {
    vm: &'a VmFd,
    sev_fd: u32,
    memory: &'a GuestMemoryManager,
}

impl<'a> KvmSev<'a> {
    pub fn new(vm: &'a VmFd, device: &'a SevDevice, memory: &'a GuestMemoryManager) -> Self {
        Self {
            vm,
            sev_fd: device.fd(),
            memory,
        }
    }

    fn issue_raw(&self, command: SevCommand, data: u64) -> Result<(), SevError> {
        let mut cmd = kvm_sev_cmd {
            id: command.id(),
            data,
            sev_fd: self.sev_fd,
            ..Default::default()
        };
        let result = self.vm.encrypt_op_sev(&mut cmd);
        result.map_err(|source| SevError::Command {
            command,
            fw_error: cmd.error,
            source,
        })
    }

    fn issue<T>(&self, command: SevCommand, payload: &mut T) -> Result<(), SevError> {
        self.issue_raw(command, payload as *mut T as u64)
    }

    /// Issue a command that may be a size probe.
    ///
    /// The firmware fails a probe with "invalid length" after writing the
    /// length it needs, so a probe error is only fatal when nothing was
    /// reported.
    fn issue_sized<T>(
        &self,
        command: SevCommand,
        payload: &mut T,
        probing: bool,
        reported: impl Fn(&T) -> u32,
    ) -> Result<(), SevError> {
        match self.issue(command, payload) {
            Err(err) if probing && reported(&*payload) != 0 => {
                debug!("{command} size probe: {err}");
                Ok(())
            }
            other => other,
        }
    }
}

fn buffer_parts(buf: Option<&mut [u8]>) -> Result<(u64, u32), SevError> {
    match buf {
        Some(buf) => Ok((buf.as_mut_ptr() as u64, len32(buf.len())?)),
        None => Ok((0, 0)),
    }
}

impl SevFirmware for KvmSev<'_> {
    fn init(&mut self) -> Result<(), SevError> {
        self.issue_raw(SevCommand::Init, 0)
    }

    fn launch_start(&mut self, policy: u32) -> Result<u32, SevError> {
        let mut start = LaunchStart {
            policy,
            ..Default::default()
        };
        self.issue(SevCommand::LaunchStart, &mut start)?;
        Ok(start.handle)
    }

    fn launch_update_data(&mut self, address: u64, len: usize) -> Result<(), SevError> {
        let mut update = AddressLength {
            uaddr: self.memory.host_range(address, len)?,
            len: len32(len)?,
        };
        self.issue(SevCommand::LaunchUpdateData, &mut update)
    }

    fn launch_measure(&mut self, buf: Option<&mut [u8]>) -> Result<u32, SevError> {
        let probing = buf.is_none();
        let (uaddr, len) = buffer_parts(buf)?;
        let mut measure = AddressLength { uaddr, len };
        self.issue_sized(SevCommand::LaunchMeasure, &mut measure, probing, |m| m.len)?;
        Ok(measure.len)
    }

    fn launch_finish(&mut self) -> Result<(), SevError> {
        self.issue_raw(SevCommand::LaunchFinish, 0)
    }

    fn guest_status(&mut self) -> Result<GuestStatus, SevError> {
        let mut status = GuestStatusPayload::default();
        self.issue(SevCommand::GuestStatus, &mut status)?;
        Ok(GuestStatus {
            handle: status.handle,
            policy: status.policy,
            state: status.state,
        })
    }

    fn dbg_decrypt(&mut self, address: u64, dst: &mut [u8]) -> Result<(), SevError> {
        let mut dbg = Dbg {
            src_uaddr: self.memory.host_range(address, dst.len())?,
            dst_uaddr: dst.as_mut_ptr() as u64,
            len: len32(dst.len())?,
        };
        self.issue(SevCommand::DbgDecrypt, &mut dbg)
    }

    fn send_start(
        &mut self,
        policy: u32,
        certs: &TransportCertificates,
        session: Option<&mut [u8]>,
    ) -> Result<u32, SevError> {
        let probing = session.is_none();
        let (session_uaddr, session_len) = buffer_parts(session)?;
        let mut start = SendStart {
            policy,
            pdh_cert_uaddr: certs.remote_pdh.as_ptr() as u64,
            pdh_cert_len: len32(certs.remote_pdh.len())?,
            plat_certs_uaddr: certs.remote_platform.as_ptr() as u64,
            plat_certs_len: len32(certs.remote_platform.len())?,
            amd_certs_uaddr: certs.amd_chain.as_ptr() as u64,
            amd_certs_len: len32(certs.amd_chain.len())?,
            session_uaddr,
            session_len,
        };
        self.issue_sized(SevCommand::SendStart, &mut start, probing, |s| s.session_len)?;
        Ok(start.session_len)
    }

    fn send_update_data(
        &mut self,
        address: u64,
        len: u32,
        header: Option<&mut [u8]>,
        transfer: &mut [u8],
    ) -> Result<TransferLengths, SevError> {
        let probing = header.is_none();
        let (hdr_uaddr, hdr_len) = buffer_parts(header)?;
        let (trans_uaddr, trans_len) = if probing {
            (0, 0)
        } else {
            buffer_parts(Some(transfer))?
        };
        let mut update = UpdateData {
            hdr_uaddr,
            hdr_len,
            guest_uaddr: self.memory.host_range(address, len as usize)?,
            guest_len: len,
            trans_uaddr,
            trans_len,
        };
        self.issue_sized(SevCommand::SendUpdateData, &mut update, probing, |u| u.hdr_len)?;
        Ok(TransferLengths {
            header: update.hdr_len,
            transfer: update.trans_len,
        })
    }

    fn send_finish(&mut self) -> Result<(), SevError> {
        self.issue_raw(SevCommand::SendFinish, 0)
    }

    fn receive_start(&mut self, policy: u32, pdh: &[u8], session: &[u8]) -> Result<u32, SevError> {
        let mut start = ReceiveStart {
            handle: 0,
            policy,
            pdh_uaddr: pdh.as_ptr() as u64,
            pdh_len: len32(pdh.len())?,
            session_uaddr: session.as_ptr() as u64,
            session_len: len32(session.len())?,
        };
        self.issue(SevCommand::ReceiveStart, &mut start)?;
        Ok(start.handle)
    }

    fn receive_update_data(
        &mut self,
        address: u64,
        header: &[u8],
        transfer: &[u8],
    ) -> Result<(), SevError> {
        let mut update = UpdateData {
            hdr_uaddr: header.as_ptr() as u64,
            hdr_len: len32(header.len())?,
            guest_uaddr: self.memory.host_range(address, transfer.len())?,
            guest_len: len32(transfer.len())?,
            trans_uaddr: transfer.as_ptr() as u64,
            trans_len: len32(transfer.len())?,
        };
        self.issue(SevCommand::ReceiveUpdateData, &mut update)
    }

    fn receive_finish(&mut self) -> Result<(), SevError> {
        self.issue_raw(SevCommand::ReceiveFinish, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sev_issue_cmd_request_code() {
        // _IOWR('S', 0, 16 bytes)
        assert_eq!(SEV_ISSUE_CMD(), 0xc010_5300);
    }

    #[test]
    fn buffer_parts_for_size_query() {
        assert_eq!(buffer_parts(None).unwrap(), (0, 0));
        let mut buf = [0u8; 32];
        let (addr, len) = buffer_parts(Some(&mut buf)).unwrap();
        assert_ne!(addr, 0);
        assert_eq!(len, 32);
    }

    #[test]
    fn platform_state_names() {
        let status = PlatformStatus {
            api_major: 0,
            api_minor: 24,
            state: 1,
            flags: 0,
            build: 15,
            guest_count: 0,
        };
        assert_eq!(status.state_name(), "INIT");
        assert!(status.to_string().starts_with("api 0.24 build 15"));
    }

    #[test]
    #[ignore = "requires /dev/sev"]
    fn platform_status_on_sev_host() {
        let device = SevDevice::open().unwrap();
        let status = device.platform_status().unwrap();
        assert!(status.api_major > 0 || status.api_minor > 0);
    }
}
