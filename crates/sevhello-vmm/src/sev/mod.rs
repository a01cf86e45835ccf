//! AMD SEV support: launch, debug access and transport commands.
//!
//! Every firmware command reaches the hardware through
//! `KVM_MEMORY_ENCRYPT_OP` on the VM fd, tagged with an open `/dev/sev`
//! fd.  The commands are grouped behind the [`SevFirmware`] trait so the
//! launch state machine ([`ConfidentialSession`]) and the migration
//! transport can be driven by a software stand-in on hosts without SEV.
//!
//! Several commands size their output buffer in two calls: the first call
//! passes no buffer and the firmware reports the length it needs, the
//! second passes a buffer of that length.  [`discover_then_fetch`] and
//! [`probe_length`] implement that once for every call site.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::certs::TransportCertificates;
use crate::memory::MemoryError;
use crate::verified::paging;
use crate::vm::ErrorKind;

mod ioctl;
mod launch;

#[cfg(test)]
pub(crate) mod mock;

pub use ioctl::{KvmSev, PlatformStatus, SevDevice, SEV_DEVICE_PATH};
pub use launch::{ConfidentialSession, LaunchState};

// ═══════════════════════════════════════════════════════════════════════
//  Commands
// ═══════════════════════════════════════════════════════════════════════

/// `KVM_MEMORY_ENCRYPT_OP` command ids used by the VMM.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SevCommand {
    Init = 0,
    LaunchStart = 2,
    LaunchUpdateData = 3,
    LaunchMeasure = 6,
    LaunchFinish = 7,
    SendStart = 8,
    SendUpdateData = 9,
    SendFinish = 11,
    ReceiveStart = 12,
    ReceiveUpdateData = 13,
    ReceiveFinish = 15,
    GuestStatus = 16,
    DbgDecrypt = 17,
}

impl SevCommand {
    #[inline]
    pub const fn id(self) -> u32 {
        self as u32
    }

    pub const fn name(self) -> &'static str {
        match self {
            SevCommand::Init => "KVM_SEV_INIT",
            SevCommand::LaunchStart => "KVM_SEV_LAUNCH_START",
            SevCommand::LaunchUpdateData => "KVM_SEV_LAUNCH_UPDATE_DATA",
            SevCommand::LaunchMeasure => "KVM_SEV_LAUNCH_MEASURE",
            SevCommand::LaunchFinish => "KVM_SEV_LAUNCH_FINISH",
            SevCommand::SendStart => "KVM_SEV_SEND_START",
            SevCommand::SendUpdateData => "KVM_SEV_SEND_UPDATE_DATA",
            SevCommand::SendFinish => "KVM_SEV_SEND_FINISH",
            SevCommand::ReceiveStart => "KVM_SEV_RECEIVE_START",
            SevCommand::ReceiveUpdateData => "KVM_SEV_RECEIVE_UPDATE_DATA",
            SevCommand::ReceiveFinish => "KVM_SEV_RECEIVE_FINISH",
            SevCommand::GuestStatus => "KVM_SEV_GUEST_STATUS",
            SevCommand::DbgDecrypt => "KVM_SEV_DBG_DECRYPT",
        }
    }
}

impl fmt::Display for SevCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Guest handle, policy and firmware state as reported by `GUEST_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuestStatus {
    pub handle: u32,
    pub policy: u32,
    pub state: u32,
}

impl GuestStatus {
    pub fn state_name(&self) -> &'static str {
        match self.state {
            0 => "UNINIT",
            1 => "LUPDATE",
            2 => "LSECRET",
            3 => "RUNNING",
            4 => "SUPDATE",
            5 => "RUPDATE",
            6 => "SENT",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for GuestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handle={} policy={:#x} state={} ({})",
            self.handle,
            self.policy,
            self.state,
            self.state_name()
        )
    }
}

/// Header and transfer sizes reported by `SEND_UPDATE_DATA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferLengths {
    pub header: u32,
    pub transfer: u32,
}

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum SevError {
    #[error("Failed to open {path}: {source}")]
    DeviceOpen {
        path: &'static str,
        source: io::Error,
    },

    #[error("SEV platform status failed (firmware error {fw_error:#x}): {source}")]
    PlatformStatus { fw_error: u32, source: io::Error },

    /// The host does not advertise SEV in CPUID.
    #[error("Host CPU does not support SEV")]
    Unsupported,

    #[error("Host reports C-bit position {position}, outside the usable range")]
    CBitUnavailable { position: u32 },

    /// A firmware command failed.  `fw_error` is the SEV status code
    /// written back by the kernel, 0 when the failure happened in KVM.
    #[error("{command} failed (firmware error {fw_error:#x}): {source}")]
    Command {
        command: SevCommand,
        fw_error: u32,
        source: kvm_ioctls::Error,
    },

    #[error("{command} reported a zero-length buffer")]
    ZeroLength { command: SevCommand },

    #[error("{operation} requires SEV state {expected:?}, session is {actual:?}")]
    InvalidState {
        operation: &'static str,
        expected: LaunchState,
        actual: LaunchState,
    },

    #[error("Buffer of {len} bytes exceeds the 32-bit SEV length field")]
    LengthOverflow { len: usize },

    #[error("Guest is not running under SEV")]
    NotConfidential,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl SevError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SevError::DeviceOpen { .. }
            | SevError::Unsupported
            | SevError::CBitUnavailable { .. }
            | SevError::NotConfidential => ErrorKind::DeviceUnavailable,
            SevError::Memory(e) => e.kind(),
            _ => ErrorKind::ProtocolError,
        }
    }

    /// SEV firmware status code, when the failure carried one.
    pub fn firmware_code(&self) -> Option<u32> {
        match self {
            SevError::Command { fw_error, .. } | SevError::PlatformStatus { fw_error, .. } => {
                Some(*fw_error)
            }
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Firmware seam
// ═══════════════════════════════════════════════════════════════════════

/// SEV firmware commands against one guest.
///
/// Guest memory is addressed by guest-physical address; implementations
/// translate to whatever the transport needs.  Methods taking an
/// `Option` buffer are size probes when given `None`.
pub trait SevFirmware {
    fn init(&mut self) -> Result<(), SevError>;

    /// Returns the new guest handle.
    fn launch_start(&mut self, policy: u32) -> Result<u32, SevError>;

    fn launch_update_data(&mut self, address: u64, len: usize) -> Result<(), SevError>;

    /// Returns the measurement length (needed or written).
    fn launch_measure(&mut self, buf: Option<&mut [u8]>) -> Result<u32, SevError>;

    fn launch_finish(&mut self) -> Result<(), SevError>;

    fn guest_status(&mut self) -> Result<GuestStatus, SevError>;

    /// Decrypt guest memory at `address` into `dst`.
    fn dbg_decrypt(&mut self, address: u64, dst: &mut [u8]) -> Result<(), SevError>;

    /// Returns the session blob length (needed or written).
    fn send_start(
        &mut self,
        policy: u32,
        certs: &TransportCertificates,
        session: Option<&mut [u8]>,
    ) -> Result<u32, SevError>;

    /// Export `len` bytes at `address`.  With `header == None` only the
    /// buffer lengths are queried and `transfer` is ignored.
    fn send_update_data(
        &mut self,
        address: u64,
        len: u32,
        header: Option<&mut [u8]>,
        transfer: &mut [u8],
    ) -> Result<TransferLengths, SevError>;

    fn send_finish(&mut self) -> Result<(), SevError>;

    /// Returns the new guest handle.
    fn receive_start(&mut self, policy: u32, pdh: &[u8], session: &[u8]) -> Result<u32, SevError>;

    /// Import `transfer` to `address`; the guest length equals the transfer
    /// length.
    fn receive_update_data(
        &mut self,
        address: u64,
        header: &[u8],
        transfer: &[u8],
    ) -> Result<(), SevError>;

    fn receive_finish(&mut self) -> Result<(), SevError>;
}

/// Validate a firmware-reported buffer length.
pub fn probe_length(command: SevCommand, reported: u32) -> Result<usize, SevError> {
    if reported == 0 {
        return Err(SevError::ZeroLength { command });
    }
    Ok(reported as usize)
}

/// Ask for the buffer size with `call(None)`, then fetch with a buffer of
/// that size.  The result is trimmed to the length the second call
/// reports, if smaller.
pub fn discover_then_fetch<F>(command: SevCommand, mut call: F) -> Result<Vec<u8>, SevError>
where
    F: FnMut(Option<&mut [u8]>) -> Result<u32, SevError>,
{
    let len = probe_length(command, call(None)?)?;
    let mut buf = vec![0u8; len];
    let written = call(Some(&mut buf))? as usize;
    if written > 0 && written < buf.len() {
        buf.truncate(written);
    }
    Ok(buf)
}

/// Length of a host buffer as the 32-bit field SEV structures use.
pub(crate) fn len32(len: usize) -> Result<u32, SevError> {
    u32::try_from(len).map_err(|_| SevError::LengthOverflow { len })
}

// ═══════════════════════════════════════════════════════════════════════
//  Host capability
// ═══════════════════════════════════════════════════════════════════════

/// CPUID leaf describing AMD memory encryption.
const CPUID_MEM_ENCRYPTION: u32 = 0x8000_001f;

/// `EAX` bit of [`CPUID_MEM_ENCRYPTION`] advertising SEV.
const CPUID_SEV_SUPPORTED: u32 = 1 << 1;

/// Position of the encryption bit in guest page-table entries, from
/// CPUID `0x8000_001F` `EBX[5:0]`.
#[allow(unused_unsafe)]
pub fn host_c_bit_position() -> Result<u32, SevError> {
    use std::arch::x86_64::__cpuid;

    // SAFETY: CPUID is available on every x86_64 CPU.
    let max_extended = unsafe { __cpuid(0x8000_0000) }.eax;
    if max_extended < CPUID_MEM_ENCRYPTION {
        return Err(SevError::Unsupported);
    }

    // SAFETY: as above; the leaf exists per the check.
    let leaf = unsafe { __cpuid(CPUID_MEM_ENCRYPTION) };
    if leaf.eax & CPUID_SEV_SUPPORTED == 0 {
        return Err(SevError::Unsupported);
    }

    let position = leaf.ebx & 0x3f;
    if !paging::c_bit_is_valid(position) {
        return Err(SevError::CBitUnavailable { position });
    }
    Ok(position)
}
