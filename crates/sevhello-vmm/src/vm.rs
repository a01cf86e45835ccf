//! VM lifecycle: KVM handles, guest memory and the optional SEV context.
//!
//! A [`VirtualMachine`] owns every host resource of a run.  The KVM and
//! SEV fds and the guest mapping are released when it is dropped, on
//! success and error paths alike.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::{Kvm, VmFd};
use log::{info, warn};
use thiserror::Error;

use crate::certs::{CertError, TransportCertificates};
use crate::config::{MigrationRole, VmConfig};
use crate::layout::LayoutError;
use crate::memory::{GuestMemoryManager, MemoryError, DATA_SLOT_ADDR};
use crate::migration::{self, MigrationError, ReceiveSummary, SendSummary};
use crate::sev::{self, ConfidentialSession, KvmSev, SevDevice, SevError};
use crate::vcpu::VirtualCpu;

/// `KVM_GET_API_VERSION` value every supported kernel reports.
pub const KVM_API_VERSION: i32 = 12;

/// Three pages just below 4 GiB, out of the way of guest RAM.
pub const KVM_TSS_ADDRESS: usize = 0xfffb_d000;

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Coarse classification of every failure the monitor reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// `/dev/kvm` or `/dev/sev` cannot be opened, or the host lacks SEV.
    DeviceUnavailable,
    VersionMismatch,
    /// Guest memory could not be allocated.
    ResourceExhausted,
    /// The kernel or firmware rejected a request, or a stream is malformed.
    ProtocolError,
    IoError,
    /// The guest stopped for a reason other than `hlt`.
    UnexpectedExit,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::DeviceUnavailable => "device unavailable",
            ErrorKind::VersionMismatch => "version mismatch",
            ErrorKind::ResourceExhausted => "resource exhausted",
            ErrorKind::ProtocolError => "protocol error",
            ErrorKind::IoError => "I/O error",
            ErrorKind::UnexpectedExit => "unexpected exit",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum VmError {
    #[error("Failed to open /dev/kvm: {0}")]
    KvmOpen(#[source] kvm_ioctls::Error),

    #[error("KVM API version {actual}, expected {expected}")]
    VersionMismatch { expected: i32, actual: i32 },

    #[error("Failed to create VM: {0}")]
    VmCreate(#[source] kvm_ioctls::Error),

    #[error("Failed to set TSS address: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    #[error("Failed to set user memory region: {0}")]
    SetUserMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("Failed to create vCPU: {0}")]
    VcpuCreate(#[source] kvm_ioctls::Error),

    #[error("Failed to query vCPU mmap size: {0}")]
    VcpuMmapSize(#[source] kvm_ioctls::Error),

    #[error("KVM reported a zero-sized vCPU mapping")]
    EmptyVcpuMmap,

    #[error("Failed to get vCPU registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to set vCPU registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to get vCPU special registers: {0}")]
    GetSregs(#[source] kvm_ioctls::Error),

    #[error("Failed to set vCPU special registers: {0}")]
    SetSregs(#[source] kvm_ioctls::Error),

    #[error("Failed to run vCPU: {0}")]
    VcpuRun(#[source] kvm_ioctls::Error),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Sev(#[from] SevError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Certificates(#[from] CertError),

    #[error("Console write failed: {0}")]
    Console(#[source] io::Error),

    #[error("Failed to open migration file {path}: {source}")]
    MigrationFile { path: PathBuf, source: io::Error },

    #[error("Failed to read guest image {path}: {source}")]
    GuestImage { path: PathBuf, source: io::Error },

    /// Exit other than `hlt` or console I/O.  `reason` is the raw
    /// `KVM_EXIT_*` code.
    #[error("Unexpected vCPU exit {reason}: {detail}")]
    UnexpectedExit { reason: u32, detail: String },

    #[error("Role {role} needs transport certificates")]
    MissingCertificates { role: MigrationRole },
}

impl VmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::KvmOpen(_) => ErrorKind::DeviceUnavailable,
            VmError::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            VmError::Memory(e) | VmError::Layout(LayoutError::Memory(e)) => e.kind(),
            VmError::Sev(e) => e.kind(),
            VmError::Migration(e) => e.kind(),
            VmError::Certificates(e) => e.kind(),
            VmError::Console(_) | VmError::MigrationFile { .. } | VmError::GuestImage { .. } => {
                ErrorKind::IoError
            }
            VmError::VcpuRun(_) | VmError::UnexpectedExit { .. } => ErrorKind::UnexpectedExit,
            _ => ErrorKind::ProtocolError,
        }
    }

    /// SEV firmware status code, when the failure carried one.
    pub fn firmware_code(&self) -> Option<u32> {
        match self {
            VmError::Sev(e) => e.firmware_code(),
            VmError::Migration(e) => e.firmware_code(),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  VirtualMachine
// ═══════════════════════════════════════════════════════════════════════

pub struct VirtualMachine {
    kvm: Kvm,
    vm: VmFd,
    memory: GuestMemoryManager,
    config: VmConfig,
    sev: Option<SevDevice>,
    session: ConfidentialSession,
    c_bit: Option<u32>,
}

impl VirtualMachine {
    /// Open KVM, create the VM and register `config.memory_size` bytes of
    /// guest memory as slot 0 at guest-physical 0.
    pub fn open(config: VmConfig) -> Result<Self, VmError> {
        let kvm = Kvm::new().map_err(VmError::KvmOpen)?;

        let actual = kvm.get_api_version();
        if actual != KVM_API_VERSION {
            return Err(VmError::VersionMismatch {
                expected: KVM_API_VERSION,
                actual,
            });
        }

        let vm = kvm.create_vm().map_err(VmError::VmCreate)?;
        vm.set_tss_address(KVM_TSS_ADDRESS)
            .map_err(VmError::SetTssAddress)?;

        let memory = GuestMemoryManager::new(config.memory_size)?;
        let region = kvm_userspace_memory_region {
            slot: 0,
            guest_phys_addr: 0,
            memory_size: memory.size() as u64,
            userspace_addr: memory.host_address()?,
            flags: 0,
        };
        // SAFETY: the region is backed by `memory`, which lives as long as
        // the VM fd in this struct.
        unsafe { vm.set_user_memory_region(region) }.map_err(VmError::SetUserMemoryRegion)?;

        info!(
            "VM created: {} mode, role {}, {} KiB",
            config.mode,
            config.role,
            config.memory_size / 1024
        );

        Ok(Self {
            kvm,
            vm,
            memory,
            session: ConfidentialSession::new(config.policy),
            config,
            sev: None,
            c_bit: None,
        })
    }

    /// Create vCPU 0.  With SEV this must follow [`sev_init`](Self::sev_init).
    pub fn create_vcpu(&self) -> Result<VirtualCpu, VmError> {
        let mmap_size = self
            .kvm
            .get_vcpu_mmap_size()
            .map_err(VmError::VcpuMmapSize)?;
        if mmap_size == 0 {
            return Err(VmError::EmptyVcpuMmap);
        }
        let fd = self.vm.create_vcpu(0).map_err(VmError::VcpuCreate)?;
        info!("vCPU 0 created, kvm_run mapping {mmap_size} bytes");
        Ok(VirtualCpu::new(fd, mmap_size))
    }

    /// Open `/dev/sev`, learn the C-bit and run `KVM_SEV_INIT`.
    pub fn sev_init(&mut self) -> Result<(), VmError> {
        let c_bit = sev::host_c_bit_position()?;
        info!("Host C-bit position: {c_bit}");

        let device = SevDevice::open()?;
        match device.platform_status() {
            Ok(status) => info!("SEV platform: {status}"),
            Err(e) => warn!("SEV platform status unavailable: {e}"),
        }
        self.session.open()?;
        self.sev = Some(device);
        self.c_bit = Some(c_bit);

        self.with_firmware(|session, fw| Ok(session.initialize(fw)?))
    }

    fn with_firmware<T>(
        &mut self,
        f: impl FnOnce(&mut ConfidentialSession, &mut KvmSev<'_>) -> Result<T, VmError>,
    ) -> Result<T, VmError> {
        let device = self.sev.as_ref().ok_or(SevError::NotConfidential)?;
        let mut fw = KvmSev::new(&self.vm, device, &self.memory);
        f(&mut self.session, &mut fw)
    }

    pub fn launch_start(&mut self) -> Result<u32, VmError> {
        self.with_firmware(|session, fw| Ok(session.launch_start(fw)?))
    }

    /// Encrypt all of guest memory, measure and finish the launch.
    /// Returns the measurement.
    pub fn launch(&mut self) -> Result<Vec<u8>, VmError> {
        let size = self.memory.size();
        self.with_firmware(|session, fw| {
            session.encrypt(fw, 0, size)?;
            let measurement = session.measure(fw)?.to_vec();
            session.finish(fw)?;
            Ok(measurement)
        })
    }

    /// Export all of guest memory to `out`.
    pub fn send<W: Write>(
        &mut self,
        certs: &TransportCertificates,
        out: W,
    ) -> Result<SendSummary, VmError> {
        let size = self.memory.size() as u64;
        self.with_firmware(|session, fw| Ok(migration::send_all(session, fw, certs, size, out)?))
    }

    /// Import a migration stream into guest memory.
    pub fn receive<R: Read>(&mut self, input: R) -> Result<ReceiveSummary, VmError> {
        let size = self.memory.size() as u64;
        self.with_firmware(|session, fw| Ok(migration::receive_all(session, fw, size, input)?))
    }

    /// Read guest memory through the firmware's debug path.
    pub fn decrypt(&mut self, address: u64, len: usize) -> Result<Vec<u8>, VmError> {
        self.with_firmware(|session, fw| Ok(session.decrypt(fw, address, len)?))
    }

    /// The data slot as `(guest view, host view)`, each `width` bytes.
    /// The guest view goes through the firmware when SEV is active.
    pub fn data_slot(&mut self, width: usize) -> Result<(u64, u64), VmError> {
        let raw = self.memory.read_data_slot(width)?;
        if self.sev.is_none() {
            return Ok((raw, raw));
        }
        let value = self.with_firmware(|session, fw| {
            Ok(session.read_value(fw, DATA_SLOT_ADDR, width)?)
        })?;
        Ok((value, raw))
    }

    pub fn log_guest_status(&mut self) {
        if self.sev.is_some() {
            let _ = self.with_firmware(|session, fw| {
                session.log_status(fw);
                Ok(())
            });
        }
    }

    pub fn memory(&self) -> &GuestMemoryManager {
        &self.memory
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Host C-bit position once SEV is initialised.
    pub fn c_bit(&self) -> Option<u32> {
        self.c_bit
    }

    pub fn is_confidential(&self) -> bool {
        self.sev.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrivilegeMode;
    use crate::sev::SevCommand;
    use kvm_bindings::KVM_EXIT_SHUTDOWN;

    #[test]
    fn error_kinds() {
        let version = VmError::VersionMismatch {
            expected: 12,
            actual: 11,
        };
        assert_eq!(version.kind(), ErrorKind::VersionMismatch);

        let exit = VmError::UnexpectedExit {
            reason: KVM_EXIT_SHUTDOWN,
            detail: "Shutdown".into(),
        };
        assert_eq!(exit.kind(), ErrorKind::UnexpectedExit);

        let mem: VmError = MemoryError::Create { size: 0x1000 }.into();
        assert_eq!(mem.kind(), ErrorKind::ResourceExhausted);

        let layout: VmError = LayoutError::Memory(MemoryError::OutOfBounds {
            address: 0,
            len: 1,
            size: 0,
        })
        .into();
        assert_eq!(layout.kind(), ErrorKind::ProtocolError);

        let stream: VmError = MigrationError::Stream {
            op: "header read",
            source: io::Error::from(io::ErrorKind::UnexpectedEof),
        }
        .into();
        assert_eq!(stream.kind(), ErrorKind::IoError);
    }

    #[test]
    fn firmware_code_survives_wrapping() {
        let sev = SevError::Command {
            command: SevCommand::ReceiveStart,
            fw_error: 0x1d,
            source: kvm_ioctls::Error::new(libc::EIO),
        };
        let err: VmError = MigrationError::from(sev).into();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
        assert_eq!(err.firmware_code(), Some(0x1d));
        assert!(err.to_string().contains("KVM_SEV_RECEIVE_START"));
    }

    #[test]
    fn rejected_kvm_calls_are_protocol_errors() {
        for err in [
            VmError::VmCreate(kvm_ioctls::Error::new(libc::EINVAL)),
            VmError::VcpuCreate(kvm_ioctls::Error::new(libc::EEXIST)),
            VmError::SetUserMemoryRegion(kvm_ioctls::Error::new(libc::EINVAL)),
        ] {
            assert_eq!(err.kind(), ErrorKind::ProtocolError, "{err}");
        }
    }

    #[test]
    fn device_errors_are_unavailable() {
        let err: VmError = SevError::NotConfidential.into();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
        assert_eq!(ErrorKind::DeviceUnavailable.to_string(), "device unavailable");
    }

    #[test]
    #[ignore = "needs /dev/kvm"]
    fn open_and_create_vcpu() {
        let vm = VirtualMachine::open(VmConfig::new(PrivilegeMode::Long, MigrationRole::None)).unwrap();
        assert!(!vm.is_confidential());
        let vcpu = vm.create_vcpu().unwrap();
        assert!(vcpu.mmap_size() > 0);
        vcpu.configure(PrivilegeMode::Long).unwrap();
        assert_eq!(vcpu.regs().unwrap().rip, 0);
    }
}
