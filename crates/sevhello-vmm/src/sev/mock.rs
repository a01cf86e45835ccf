//! Software stand-in for the SEV firmware.
//!
//! "Ciphertext" leaving the mock is the plaintext XORed with a fixed
//! transport key, so two mocks can migrate between each other.  Guest
//! memory is plaintext unless `encrypt_at_rest` is set, in which case
//! `LAUNCH_UPDATE_DATA` and `RECEIVE_UPDATE_DATA` leave it XORed with a
//! separate memory key, the way the host sees an SEV guest.

use std::collections::VecDeque;
use std::ops::Range;

use super::{GuestStatus, SevCommand, SevError, SevFirmware, TransferLengths};
use crate::certs::TransportCertificates;

pub(crate) struct MockFirmware {
    pub memory: Vec<u8>,
    pub measurement_len: u32,
    pub session_len: u32,
    pub header_len: u32,
    /// Bytes moved by successive `SEND_UPDATE_DATA` calls; the requested
    /// length once empty.
    pub transfer_plan: VecDeque<u32>,
    pub fail_on: Option<SevCommand>,
    pub received_session: Option<Vec<u8>>,
    pub encrypt_at_rest: bool,
    calls: Vec<SevCommand>,
    state: u32,
}

impl MockFirmware {
    pub const HANDLE: u32 = 1;
    pub const FW_ERROR: u32 = 0x16;
    pub const HEADER_LEN: usize = 52;
    pub const KEY: u8 = 0xa5;
    pub const MEMORY_KEY: u8 = 0x3c;

    pub fn new(size: usize) -> Self {
        Self {
            memory: vec![0; size],
            measurement_len: 48,
            session_len: 0x1a0,
            header_len: Self::HEADER_LEN as u32,
            transfer_plan: VecDeque::new(),
            fail_on: None,
            received_session: None,
            encrypt_at_rest: false,
            calls: Vec::new(),
            state: 0,
        }
    }

    pub fn commands(&self) -> Vec<SevCommand> {
        self.calls.clone()
    }

    pub fn count(&self, command: SevCommand) -> usize {
        self.calls.iter().filter(|c| **c == command).count()
    }

    pub fn encrypt_bytes(&self, plain: &[u8]) -> Vec<u8> {
        plain.iter().map(|b| b ^ Self::KEY).collect()
    }

    /// Key guest memory is held under.
    fn memory_key(&self) -> u8 {
        if self.encrypt_at_rest {
            Self::MEMORY_KEY
        } else {
            0
        }
    }

    fn call(&mut self, command: SevCommand) -> Result<(), SevError> {
        self.calls.push(command);
        if self.fail_on == Some(command) {
            return Err(SevError::Command {
                command,
                fw_error: Self::FW_ERROR,
                source: kvm_ioctls::Error::new(libc::EIO),
            });
        }
        Ok(())
    }

    fn range(&self, command: SevCommand, address: u64, len: usize) -> Result<Range<usize>, SevError> {
        let start = address as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.memory.len() => Ok(start..end),
            _ => Err(SevError::Command {
                command,
                fw_error: 0,
                source: kvm_ioctls::Error::new(libc::EFAULT),
            }),
        }
    }
}

impl SevFirmware for MockFirmware {
    fn init(&mut self) -> Result<(), SevError> {
        self.call(SevCommand::Init)
    }

    fn launch_start(&mut self, _policy: u32) -> Result<u32, SevError> {
        self.call(SevCommand::LaunchStart)?;
        self.state = 1;
        Ok(Self::HANDLE)
    }

    fn launch_update_data(&mut self, address: u64, len: usize) -> Result<(), SevError> {
        self.call(SevCommand::LaunchUpdateData)?;
        let range = self.range(SevCommand::LaunchUpdateData, address, len)?;
        let key = self.memory_key();
        self.memory[range].iter_mut().for_each(|b| *b ^= key);
        Ok(())
    }

    fn launch_measure(&mut self, buf: Option<&mut [u8]>) -> Result<u32, SevError> {
        self.call(SevCommand::LaunchMeasure)?;
        if let Some(buf) = buf {
            buf.fill(0x4d);
            self.state = 2;
        }
        Ok(self.measurement_len)
    }

    fn launch_finish(&mut self) -> Result<(), SevError> {
        self.call(SevCommand::LaunchFinish)?;
        self.state = 3;
        Ok(())
    }

    fn guest_status(&mut self) -> Result<GuestStatus, SevError> {
        self.call(SevCommand::GuestStatus)?;
        Ok(GuestStatus {
            handle: Self::HANDLE,
            policy: 0,
            state: self.state,
        })
    }

    fn dbg_decrypt(&mut self, address: u64, dst: &mut [u8]) -> Result<(), SevError> {
        self.call(SevCommand::DbgDecrypt)?;
        let range = self.range(SevCommand::DbgDecrypt, address, dst.len())?;
        let key = self.memory_key();
        for (out, src) in dst.iter_mut().zip(&self.memory[range]) {
            *out = src ^ key;
        }
        Ok(())
    }

    fn send_start(
        &mut self,
        _policy: u32,
        _certs: &TransportCertificates,
        session: Option<&mut [u8]>,
    ) -> Result<u32, SevError> {
        self.call(SevCommand::SendStart)?;
        if let Some(session) = session {
            session.fill(0x53);
            self.state = 4;
        }
        Ok(self.session_len)
    }

    fn send_update_data(
        &mut self,
        address: u64,
        len: u32,
        header: Option<&mut [u8]>,
        transfer: &mut [u8],
    ) -> Result<TransferLengths, SevError> {
        self.call(SevCommand::SendUpdateData)?;
        let Some(header) = header else {
            return Ok(TransferLengths {
                header: self.header_len,
                transfer: len,
            });
        };

        let moved = self.transfer_plan.pop_front().unwrap_or(len).min(len) as usize;
        let range = self.range(SevCommand::SendUpdateData, address, moved)?;
        header.fill(0x48);
        let key = self.memory_key() ^ Self::KEY;
        for (dst, src) in transfer[..moved].iter_mut().zip(&self.memory[range]) {
            *dst = src ^ key;
        }
        Ok(TransferLengths {
            header: self.header_len,
            transfer: moved as u32,
        })
    }

    fn send_finish(&mut self) -> Result<(), SevError> {
        self.call(SevCommand::SendFinish)?;
        self.state = 6;
        Ok(())
    }

    fn receive_start(&mut self, _policy: u32, _pdh: &[u8], session: &[u8]) -> Result<u32, SevError> {
        self.call(SevCommand::ReceiveStart)?;
        self.received_session = Some(session.to_vec());
        self.state = 5;
        Ok(Self::HANDLE)
    }

    fn receive_update_data(
        &mut self,
        address: u64,
        _header: &[u8],
        transfer: &[u8],
    ) -> Result<(), SevError> {
        self.call(SevCommand::ReceiveUpdateData)?;
        let range = self.range(SevCommand::ReceiveUpdateData, address, transfer.len())?;
        let key = self.memory_key() ^ Self::KEY;
        for (dst, src) in self.memory[range].iter_mut().zip(transfer) {
            *dst = src ^ key;
        }
        Ok(())
    }

    fn receive_finish(&mut self) -> Result<(), SevError> {
        self.call(SevCommand::ReceiveFinish)?;
        self.state = 3;
        Ok(())
    }
}
