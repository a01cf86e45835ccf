//! SEV guest session state machine.
//!
//! ```text
//! source:  Disabled → Opened → Initialized → LaunchStarted → DataEncrypted → Measured → Finished
//! sink:    Disabled → Opened → Initialized → Receiving ───────────────────────────────→ Finished
//! ```
//!
//! Each step checks the current state before talking to the firmware, so a
//! command issued out of order fails with [`SevError::InvalidState`]
//! without reaching the hardware.
//!
//! The launch measurement is kept for the life of the guest.  The transport
//! session blob only lives while a migration is in flight: it is recorded
//! at `SEND_START` or `RECEIVE_START` and dropped when that transfer
//! finishes.

use log::{debug, info, warn};

use super::{discover_then_fetch, SevCommand, SevError, SevFirmware};
use crate::memory::MemoryError;
use crate::verified::transfer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    /// No SEV for this guest.
    Disabled,
    /// `/dev/sev` is open.
    Opened,
    /// `KVM_SEV_INIT` done.
    Initialized,
    /// Guest context created by `LAUNCH_START`.
    LaunchStarted,
    /// Guest memory encrypted in place.
    DataEncrypted,
    /// Launch measurement retrieved.
    Measured,
    /// Context created by `RECEIVE_START`; chunks may be imported.
    Receiving,
    /// Guest is runnable.
    Finished,
}

/// Launch or receive progress of one SEV guest.
#[derive(Debug)]
pub struct ConfidentialSession {
    state: LaunchState,
    policy: u32,
    handle: Option<u32>,
    measurement: Option<Vec<u8>>,
    session: Option<Vec<u8>>,
}

impl ConfidentialSession {
    pub fn new(policy: u32) -> Self {
        Self {
            state: LaunchState::Disabled,
            policy,
            handle: None,
            measurement: None,
            session: None,
        }
    }

    pub fn state(&self) -> LaunchState {
        self.state
    }

    pub fn policy(&self) -> u32 {
        self.policy
    }

    /// Firmware handle, once a context exists.
    pub fn handle(&self) -> Option<u32> {
        self.handle
    }

    /// Launch measurement, once retrieved.
    pub fn measurement(&self) -> Option<&[u8]> {
        self.measurement.as_deref()
    }

    /// Transport session blob of the migration in flight.
    pub fn session_blob(&self) -> Option<&[u8]> {
        self.session.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.state == LaunchState::Finished
    }

    fn require(&self, operation: &'static str, expected: LaunchState) -> Result<(), SevError> {
        if self.state != expected {
            return Err(SevError::InvalidState {
                operation,
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn enter(&mut self, next: LaunchState) {
        info!("SEV session: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Record that the platform device is open.
    pub fn open(&mut self) -> Result<(), SevError> {
        self.require("open", LaunchState::Disabled)?;
        self.enter(LaunchState::Opened);
        Ok(())
    }

    pub fn initialize<F: SevFirmware + ?Sized>(&mut self, fw: &mut F) -> Result<(), SevError> {
        self.require("init", LaunchState::Opened)?;
        fw.init()?;
        self.enter(LaunchState::Initialized);
        Ok(())
    }

    pub fn launch_start<F: SevFirmware + ?Sized>(&mut self, fw: &mut F) -> Result<u32, SevError> {
        self.require("launch start", LaunchState::Initialized)?;
        let handle = fw.launch_start(self.policy)?;
        self.handle = Some(handle);
        self.enter(LaunchState::LaunchStarted);
        self.log_status(fw);
        Ok(handle)
    }

    /// Encrypt `len` bytes of guest memory at `address` in place.
    pub fn encrypt<F: SevFirmware + ?Sized>(
        &mut self,
        fw: &mut F,
        address: u64,
        len: usize,
    ) -> Result<(), SevError> {
        self.require("launch update", LaunchState::LaunchStarted)?;
        fw.launch_update_data(address, len)?;
        info!("SEV launch data encrypted: {len:#x} bytes at {address:#x}");
        self.enter(LaunchState::DataEncrypted);
        self.log_status(fw);
        Ok(())
    }

    pub fn measure<F: SevFirmware + ?Sized>(&mut self, fw: &mut F) -> Result<&[u8], SevError> {
        self.require("launch measure", LaunchState::DataEncrypted)?;
        let measurement = discover_then_fetch(SevCommand::LaunchMeasure, |buf| fw.launch_measure(buf))?;
        info!("SEV launch measurement: {} bytes", measurement.len());
        self.enter(LaunchState::Measured);
        Ok(self.measurement.insert(measurement).as_slice())
    }

    pub fn finish<F: SevFirmware + ?Sized>(&mut self, fw: &mut F) -> Result<(), SevError> {
        self.require("launch finish", LaunchState::Measured)?;
        fw.launch_finish()?;
        self.enter(LaunchState::Finished);
        self.log_status(fw);
        Ok(())
    }

    /// Keep the `SEND_START` blob for the export that follows.
    pub fn record_send_session(&mut self, blob: Vec<u8>) -> Result<&[u8], SevError> {
        self.require_running("send start")?;
        if blob.is_empty() {
            return Err(SevError::ZeroLength {
                command: SevCommand::SendStart,
            });
        }
        Ok(self.session.insert(blob).as_slice())
    }

    /// Drop the export's session blob after `SEND_FINISH`.
    pub fn end_send(&mut self) -> Option<Vec<u8>> {
        let blob = self.session.take();
        if let Some(blob) = &blob {
            debug!("SEV send session closed, {} byte blob released", blob.len());
        }
        blob
    }

    /// Create a guest context from an incoming session.
    pub fn begin_receive<F: SevFirmware + ?Sized>(
        &mut self,
        fw: &mut F,
        pdh: &[u8],
        session: &[u8],
    ) -> Result<u32, SevError> {
        self.require("receive start", LaunchState::Initialized)?;
        let handle = fw.receive_start(self.policy, pdh, session)?;
        self.handle = Some(handle);
        self.session = Some(session.to_vec());
        self.enter(LaunchState::Receiving);
        self.log_status(fw);
        Ok(handle)
    }

    pub fn receive_chunk<F: SevFirmware + ?Sized>(
        &mut self,
        fw: &mut F,
        address: u64,
        header: &[u8],
        transfer: &[u8],
    ) -> Result<(), SevError> {
        self.require("receive update", LaunchState::Receiving)?;
        fw.receive_update_data(address, header, transfer)
    }

    pub fn finish_receive<F: SevFirmware + ?Sized>(&mut self, fw: &mut F) -> Result<(), SevError> {
        self.require("receive finish", LaunchState::Receiving)?;
        fw.receive_finish()?;
        self.session = None;
        self.enter(LaunchState::Finished);
        self.log_status(fw);
        Ok(())
    }

    /// Fail unless the guest is runnable.
    pub fn require_running(&self, operation: &'static str) -> Result<(), SevError> {
        self.require(operation, LaunchState::Finished)
    }

    /// Read `len` bytes of guest memory at `address` through the firmware.
    pub fn decrypt<F: SevFirmware + ?Sized>(
        &self,
        fw: &mut F,
        address: u64,
        len: usize,
    ) -> Result<Vec<u8>, SevError> {
        self.require_running("debug decrypt")?;
        let mut plain = vec![0u8; len];
        fw.dbg_decrypt(address, &mut plain)?;
        Ok(plain)
    }

    /// Read the `width`-byte little-endian value at `address` as the guest
    /// sees it, through the firmware's debug decrypt.
    pub fn read_value<F: SevFirmware + ?Sized>(
        &self,
        fw: &mut F,
        address: u64,
        width: usize,
    ) -> Result<u64, SevError> {
        let plain = self.decrypt(fw, address, width)?;
        Ok(transfer::decode_slot(&plain, width).ok_or(MemoryError::Read { address })?)
    }

    /// Log the firmware's view of the guest.  Failures are only logged.
    pub fn log_status<F: SevFirmware + ?Sized>(&self, fw: &mut F) {
        match fw.guest_status() {
            Ok(status) => info!("SEV guest status: {status}"),
            Err(e) => warn!("SEV guest status unavailable: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sev::mock::MockFirmware;
    use crate::vm::ErrorKind;

    fn launched(fw: &mut MockFirmware) -> ConfidentialSession {
        let mut session = ConfidentialSession::new(0);
        session.open().unwrap();
        session.initialize(fw).unwrap();
        session.launch_start(fw).unwrap();
        let len = fw.memory.len();
        session.encrypt(fw, 0, len).unwrap();
        session.measure(fw).unwrap();
        session.finish(fw).unwrap();
        session
    }

    #[test]
    fn launch_walks_every_state() {
        let mut fw = MockFirmware::new(0x10000);
        let session = launched(&mut fw);

        assert!(session.is_running());
        assert_eq!(session.handle(), Some(MockFirmware::HANDLE));
        assert_eq!(session.measurement().map(<[u8]>::len), Some(48));
        assert_eq!(
            fw.commands(),
            [
                SevCommand::Init,
                SevCommand::LaunchStart,
                SevCommand::GuestStatus,
                SevCommand::LaunchUpdateData,
                SevCommand::GuestStatus,
                SevCommand::LaunchMeasure,
                SevCommand::LaunchMeasure,
                SevCommand::LaunchFinish,
                SevCommand::GuestStatus,
            ]
        );
    }

    #[test]
    fn out_of_order_command_never_reaches_firmware() {
        let mut fw = MockFirmware::new(0x10000);
        let mut session = ConfidentialSession::new(0);
        session.open().unwrap();

        let err = session.encrypt(&mut fw, 0, 0x1000).unwrap_err();
        assert!(matches!(
            err,
            SevError::InvalidState {
                expected: LaunchState::LaunchStarted,
                actual: LaunchState::Opened,
                ..
            }
        ));
        assert!(fw.commands().is_empty());
    }

    #[test]
    fn zero_length_measurement_is_rejected() {
        let mut fw = MockFirmware::new(0x10000);
        fw.measurement_len = 0;
        let mut session = ConfidentialSession::new(0);
        session.open().unwrap();
        session.initialize(&mut fw).unwrap();
        session.launch_start(&mut fw).unwrap();
        session.encrypt(&mut fw, 0, 0x10000).unwrap();

        let err = session.measure(&mut fw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
        assert_eq!(session.state(), LaunchState::DataEncrypted);
    }

    #[test]
    fn firmware_failure_keeps_state() {
        let mut fw = MockFirmware::new(0x10000);
        fw.fail_on = Some(SevCommand::LaunchStart);
        let mut session = ConfidentialSession::new(0);
        session.open().unwrap();
        session.initialize(&mut fw).unwrap();

        let err = session.launch_start(&mut fw).unwrap_err();
        assert_eq!(err.firmware_code(), Some(MockFirmware::FW_ERROR));
        assert_eq!(session.state(), LaunchState::Initialized);
        assert_eq!(session.handle(), None);
    }

    #[test]
    fn receive_path() {
        let mut fw = MockFirmware::new(0x2000);
        let mut session = ConfidentialSession::new(0);
        session.open().unwrap();
        session.initialize(&mut fw).unwrap();
        session.begin_receive(&mut fw, b"pdh", b"session").unwrap();
        assert_eq!(session.session_blob(), Some(&b"session"[..]));

        let cipher = fw.encrypt_bytes(&[7u8; 0x1000]);
        session
            .receive_chunk(&mut fw, 0x1000, &[0u8; MockFirmware::HEADER_LEN], &cipher)
            .unwrap();
        session.finish_receive(&mut fw).unwrap();

        assert!(session.is_running());
        assert_eq!(session.session_blob(), None);
        assert_eq!(session.decrypt(&mut fw, 0x1000, 4).unwrap(), [7, 7, 7, 7]);
        assert_eq!(session.decrypt(&mut fw, 0, 4).unwrap(), [0, 0, 0, 0]);
    }

    #[test]
    fn send_session_lives_until_end_send() {
        let mut fw = MockFirmware::new(0x1000);
        let mut session = ConfidentialSession::new(0);
        assert!(matches!(
            session.record_send_session(vec![1; 16]),
            Err(SevError::InvalidState { .. })
        ));

        let mut session = launched(&mut fw);
        assert_eq!(session.session_blob(), None);
        assert!(matches!(
            session.record_send_session(Vec::new()),
            Err(SevError::ZeroLength { .. })
        ));
        assert_eq!(session.record_send_session(vec![0x53; 32]).unwrap().len(), 32);
        assert_eq!(session.session_blob().map(<[u8]>::len), Some(32));

        assert_eq!(session.end_send().map(|b| b.len()), Some(32));
        assert_eq!(session.session_blob(), None);
        assert!(session.measurement().is_some());
    }

    #[test]
    fn decrypt_requires_running_guest() {
        let mut fw = MockFirmware::new(0x1000);
        let session = ConfidentialSession::new(0);
        assert!(matches!(
            session.decrypt(&mut fw, 0, 16),
            Err(SevError::InvalidState { .. })
        ));
    }
}
