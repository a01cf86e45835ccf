//! Encrypted-memory migration through a framed file.
//!
//! The stream is a sequence of length-prefixed frames (see
//! [`sevhello_protocol`]):
//!
//! ```text
//! [local PDH cert][session blob] { [packet header][transfer] }*
//! ```
//!
//! The sender walks guest memory in [`MIGRATION_CHUNK_SIZE`] steps and
//! advances by however many bytes the firmware actually exported.  The
//! receiver replays pairs until the stream ends cleanly on a frame
//! boundary.  Both sides abort on the first failed frame; there is no
//! partial retry.

use std::io::{self, Read, Write};

use log::{debug, info};
use sevhello_protocol::{FrameReader, FrameWriter, MIGRATION_CHUNK_SIZE};
use thiserror::Error;

use crate::certs::TransportCertificates;
use crate::sev::{
    discover_then_fetch, probe_length, ConfidentialSession, SevCommand, SevError, SevFirmware,
};
use crate::verified::transfer;
use crate::vm::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    SessionEstablished,
    Streaming,
    Finished,
}

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Migration stream {op} failed: {source}")]
    Stream {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Sev(#[from] SevError),

    #[error("{operation} requires transfer state {expected:?}, transfer is {actual:?}")]
    InvalidState {
        operation: &'static str,
        expected: TransferState,
        actual: TransferState,
    },

    #[error("Firmware transferred no data at offset {offset:#x}")]
    EmptyTransfer { offset: u64 },

    #[error("Transfer of {len:#x} bytes at {offset:#x} overruns the {size:#x}-byte region")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
}

impl MigrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::Stream { .. } => ErrorKind::IoError,
            MigrationError::Sev(e) => e.kind(),
            _ => ErrorKind::ProtocolError,
        }
    }

    /// SEV firmware status code, when the failure carried one.
    pub fn firmware_code(&self) -> Option<u32> {
        match self {
            MigrationError::Sev(e) => e.firmware_code(),
            _ => None,
        }
    }
}

fn stream_err(op: &'static str) -> impl FnOnce(io::Error) -> MigrationError {
    move |source| MigrationError::Stream { op, source }
}

fn require(
    operation: &'static str,
    expected: TransferState,
    actual: TransferState,
) -> Result<(), MigrationError> {
    if actual != expected {
        return Err(MigrationError::InvalidState {
            operation,
            expected,
            actual,
        });
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Sender
// ═══════════════════════════════════════════════════════════════════════

/// What a completed export wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendSummary {
    pub chunks: u64,
    /// Guest bytes exported.
    pub bytes: u64,
    pub frames: u64,
    pub session_len: usize,
}

/// Exports a running SEV guest to `W`.
pub struct MigrationSender<W: Write> {
    writer: FrameWriter<W>,
    state: TransferState,
    chunks: u64,
    bytes: u64,
    session_len: usize,
}

impl<W: Write> MigrationSender<W> {
    pub fn new(out: W) -> Self {
        Self {
            writer: FrameWriter::new(out),
            state: TransferState::Idle,
            chunks: 0,
            bytes: 0,
            session_len: 0,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// `SEND_START`, then write the local certificate and session frames.
    /// The session blob stays on `session` until [`finish`](Self::finish).
    pub fn establish<F: SevFirmware + ?Sized>(
        &mut self,
        session: &mut ConfidentialSession,
        fw: &mut F,
        certs: &TransportCertificates,
    ) -> Result<(), MigrationError> {
        require("send start", TransferState::Idle, self.state)?;
        session.require_running("send start")?;

        let policy = session.policy();
        let blob = discover_then_fetch(SevCommand::SendStart, |buf| {
            fw.send_start(policy, certs, buf)
        })?;
        info!("SEV send session established: {} byte session blob", blob.len());
        session.log_status(fw);
        let blob = session.record_send_session(blob)?;

        self.writer
            .write_frame(&certs.local_pdh)
            .map_err(stream_err("certificate write"))?;
        self.writer
            .write_frame(blob)
            .map_err(stream_err("session write"))?;

        self.session_len = blob.len();
        self.state = TransferState::SessionEstablished;
        Ok(())
    }

    /// Export `region_size` bytes of guest memory from address 0.
    pub fn stream<F: SevFirmware + ?Sized>(
        &mut self,
        fw: &mut F,
        region_size: u64,
    ) -> Result<(), MigrationError> {
        require("send update", TransferState::SessionEstablished, self.state)?;
        self.state = TransferState::Streaming;

        let nominal = MIGRATION_CHUNK_SIZE as u64;
        let first = transfer::chunk_len(0, region_size, nominal);
        let probed = fw.send_update_data(0, first as u32, None, &mut [])?;
        let mut header = vec![0u8; probe_length(SevCommand::SendUpdateData, probed.header)?];
        let mut buf = vec![0u8; MIGRATION_CHUNK_SIZE];

        let mut offset = 0u64;
        while offset < region_size {
            let len = transfer::chunk_len(offset, region_size, nominal);
            let lengths = fw.send_update_data(
                offset,
                len as u32,
                Some(&mut header),
                &mut buf[..len as usize],
            )?;

            let moved = u64::from(lengths.transfer).min(len);
            let next = transfer::advance(offset, moved, region_size)
                .ok_or(MigrationError::EmptyTransfer { offset })?;
            let header_len = (lengths.header as usize).min(header.len());

            self.writer
                .write_frame(&header[..header_len])
                .map_err(stream_err("header write"))?;
            self.writer
                .write_frame(&buf[..moved as usize])
                .map_err(stream_err("transfer write"))?;
            debug!("Sent chunk {}: {moved:#x} bytes at {offset:#x}", self.chunks);

            self.chunks += 1;
            self.bytes += moved;
            offset = next;
        }
        Ok(())
    }

    /// `SEND_FINISH`, release the session blob and flush the stream.
    pub fn finish<F: SevFirmware + ?Sized>(
        &mut self,
        session: &mut ConfidentialSession,
        fw: &mut F,
    ) -> Result<SendSummary, MigrationError> {
        require("send finish", TransferState::Streaming, self.state)?;
        fw.send_finish()?;
        session.end_send();
        self.writer.flush().map_err(stream_err("flush"))?;
        self.state = TransferState::Finished;

        let summary = SendSummary {
            chunks: self.chunks,
            bytes: self.bytes,
            frames: self.writer.frames_written(),
            session_len: self.session_len,
        };
        info!(
            "Migration sent: {} chunks, {:#x} bytes, {} frames",
            summary.chunks, summary.bytes, summary.frames
        );
        Ok(summary)
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

/// Run a whole export: establish, stream `region_size` bytes, finish.
pub fn send_all<F, W>(
    session: &mut ConfidentialSession,
    fw: &mut F,
    certs: &TransportCertificates,
    region_size: u64,
    out: W,
) -> Result<SendSummary, MigrationError>
where
    F: SevFirmware + ?Sized,
    W: Write,
{
    let mut sender = MigrationSender::new(out);
    sender.establish(session, fw, certs)?;
    sender.stream(fw, region_size)?;
    sender.finish(session, fw)
}

// ═══════════════════════════════════════════════════════════════════════
//  Receiver
// ═══════════════════════════════════════════════════════════════════════

/// What a completed import placed in guest memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveSummary {
    pub chunks: u64,
    pub bytes: u64,
    /// Running offset after each chunk.
    pub offsets: Vec<u64>,
}

/// Replays a migration stream from `R` into a fresh SEV guest.
pub struct MigrationReceiver<R: Read> {
    reader: FrameReader<R>,
    state: TransferState,
    offsets: Vec<u64>,
}

impl<R: Read> MigrationReceiver<R> {
    pub fn new(input: R) -> Self {
        Self {
            reader: FrameReader::new(input),
            state: TransferState::Idle,
            offsets: Vec::new(),
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Read the certificate and session frames, then `RECEIVE_START`.
    pub fn establish<F: SevFirmware + ?Sized>(
        &mut self,
        session: &mut ConfidentialSession,
        fw: &mut F,
    ) -> Result<u32, MigrationError> {
        require("receive start", TransferState::Idle, self.state)?;

        let pdh = self
            .reader
            .read_required()
            .map_err(stream_err("certificate read"))?;
        let blob = self
            .reader
            .read_required()
            .map_err(stream_err("session read"))?;
        let handle = session.begin_receive(fw, &pdh, &blob)?;
        info!(
            "SEV receive session established: handle {handle}, {} byte certificate, {} byte session",
            pdh.len(),
            blob.len()
        );

        self.state = TransferState::SessionEstablished;
        Ok(handle)
    }

    /// Import chunk pairs until the stream ends.
    pub fn stream<F: SevFirmware + ?Sized>(
        &mut self,
        session: &mut ConfidentialSession,
        fw: &mut F,
        region_size: u64,
    ) -> Result<(), MigrationError> {
        require("receive update", TransferState::SessionEstablished, self.state)?;
        self.state = TransferState::Streaming;

        let mut offset = 0u64;
        while let Some(header) = self.reader.read_frame().map_err(stream_err("header read"))? {
            let data = self
                .reader
                .read_required()
                .map_err(stream_err("transfer read"))?;
            let len = data.len() as u64;
            if len == 0 {
                return Err(MigrationError::EmptyTransfer { offset });
            }
            let next = transfer::advance(offset, len, region_size).ok_or(MigrationError::OutOfBounds {
                offset,
                len,
                size: region_size,
            })?;

            session.receive_chunk(fw, offset, &header, &data)?;
            debug!("Received chunk {}: {len:#x} bytes at {offset:#x}", self.offsets.len());

            offset = next;
            self.offsets.push(offset);
        }
        Ok(())
    }

    /// `RECEIVE_FINISH`; the guest is runnable afterwards.
    pub fn finish<F: SevFirmware + ?Sized>(
        &mut self,
        session: &mut ConfidentialSession,
        fw: &mut F,
    ) -> Result<ReceiveSummary, MigrationError> {
        require("receive finish", TransferState::Streaming, self.state)?;
        session.finish_receive(fw)?;
        self.state = TransferState::Finished;

        let summary = ReceiveSummary {
            chunks: self.offsets.len() as u64,
            bytes: self.offsets.last().copied().unwrap_or(0),
            offsets: std::mem::take(&mut self.offsets),
        };
        info!("Migration received: {} chunks, {:#x} bytes", summary.chunks, summary.bytes);
        Ok(summary)
    }
}

/// Run a whole import: establish, stream into `region_size` bytes, finish.
pub fn receive_all<F, R>(
    session: &mut ConfidentialSession,
    fw: &mut F,
    region_size: u64,
    input: R,
) -> Result<ReceiveSummary, MigrationError>
where
    F: SevFirmware + ?Sized,
    R: Read,
{
    let mut receiver = MigrationReceiver::new(input);
    receiver.establish(session, fw)?;
    receiver.stream(session, fw, region_size)?;
    receiver.finish(session, fw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sev::mock::MockFirmware;
    use std::collections::VecDeque;
    use std::fs::File;
    use std::io::Cursor;

    fn certs() -> TransportCertificates {
        TransportCertificates {
            local_pdh: vec![0x11; 2084],
            remote_pdh: vec![0x22; 2084],
            remote_platform: vec![0x33; 3 * 2084],
            amd_chain: vec![0x44; 2 * 832],
        }
    }

    fn running_source(size: usize) -> (ConfidentialSession, MockFirmware) {
        let mut fw = MockFirmware::new(size);
        for (i, b) in fw.memory.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let mut session = ConfidentialSession::new(0);
        session.open().unwrap();
        session.initialize(&mut fw).unwrap();
        session.launch_start(&mut fw).unwrap();
        session.encrypt(&mut fw, 0, size).unwrap();
        session.measure(&mut fw).unwrap();
        session.finish(&mut fw).unwrap();
        (session, fw)
    }

    fn initialized_sink(size: usize) -> (ConfidentialSession, MockFirmware) {
        let mut fw = MockFirmware::new(size);
        let mut session = ConfidentialSession::new(0);
        session.open().unwrap();
        session.initialize(&mut fw).unwrap();
        (session, fw)
    }

    #[test]
    fn round_trip_with_short_transfers() {
        let size = 0x2800;
        let (mut session, mut src) = running_source(size);
        src.transfer_plan = VecDeque::from([4096, 1000, 4096]);

        let mut sender = MigrationSender::new(Vec::new());
        sender.establish(&mut session, &mut src, &certs()).unwrap();
        sender.stream(&mut src, size as u64).unwrap();
        assert_eq!(session.session_blob(), Some(&[0x53u8; 0x1a0][..]));
        let summary = sender.finish(&mut session, &mut src).unwrap();
        assert_eq!(session.session_blob(), None);
        assert_eq!(sender.state(), TransferState::Finished);
        let stream = sender.into_inner();

        // 4096 + 1000 + 4096 + 1048
        assert_eq!(summary.chunks, 4);
        assert_eq!(summary.bytes, size as u64);
        assert_eq!(summary.frames, 2 + 2 * 4);
        assert_eq!(summary.session_len, 0x1a0);
        assert_eq!(src.count(SevCommand::SendUpdateData), 5);
        assert_eq!(src.count(SevCommand::SendFinish), 1);

        let (mut sink_session, mut dst) = initialized_sink(size);
        let received = receive_all(&mut sink_session, &mut dst, size as u64, Cursor::new(stream)).unwrap();

        assert_eq!(received.offsets, [4096, 5096, 9192, 10240]);
        assert_eq!(received.bytes, size as u64);
        assert_eq!(dst.memory, src.memory);
        assert_eq!(dst.received_session.as_deref(), Some(&[0x53u8; 0x1a0][..]));
        assert!(sink_session.is_running());
    }

    #[test]
    fn ciphertext_at_rest_survives_migration() {
        let size = 0x2000;
        let mut src = MockFirmware::new(size);
        src.encrypt_at_rest = true;
        src.memory[0x400] = 42;
        let mut session = ConfidentialSession::new(0);
        session.open().unwrap();
        session.initialize(&mut src).unwrap();
        session.launch_start(&mut src).unwrap();
        session.encrypt(&mut src, 0, size).unwrap();
        session.measure(&mut src).unwrap();
        session.finish(&mut src).unwrap();
        assert_ne!(src.memory[0x400], 42);

        let mut out = Vec::new();
        send_all(&mut session, &mut src, &certs(), size as u64, &mut out).unwrap();

        let (mut sink_session, mut dst) = initialized_sink(size);
        dst.encrypt_at_rest = true;
        receive_all(&mut sink_session, &mut dst, size as u64, out.as_slice()).unwrap();
        assert_eq!(dst.memory, src.memory);
        assert_eq!(sink_session.decrypt(&mut dst, 0x400, 1).unwrap(), [42]);
    }

    #[test]
    fn offsets_are_prefix_sums() {
        let size = 0x3000;
        let (mut session, mut src) = running_source(size);
        let mut out = Vec::new();
        send_all(&mut session, &mut src, &certs(), size as u64, &mut out).unwrap();

        let (mut sink_session, mut dst) = initialized_sink(size);
        let received = receive_all(&mut sink_session, &mut dst, size as u64, out.as_slice()).unwrap();
        assert_eq!(received.chunks, 3);
        assert_eq!(received.offsets, [0x1000, 0x2000, 0x3000]);
        assert_eq!(dst.count(SevCommand::ReceiveUpdateData), 3);
    }

    #[test]
    fn file_backed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(sevhello_protocol::DEFAULT_MIGRATION_FILE);
        let size = 0x2000;

        let (mut session, mut src) = running_source(size);
        let file = File::create(&path).unwrap();
        send_all(&mut session, &mut src, &certs(), size as u64, file).unwrap();

        let (mut sink_session, mut dst) = initialized_sink(size);
        let file = File::open(&path).unwrap();
        receive_all(&mut sink_session, &mut dst, size as u64, file).unwrap();
        assert_eq!(dst.memory, src.memory);
    }

    #[test]
    fn stream_starts_with_local_certificate() {
        let (mut session, mut src) = running_source(0x1000);
        let mut out = Vec::new();
        send_all(&mut session, &mut src, &certs(), 0x1000, &mut out).unwrap();

        let mut reader = FrameReader::new(out.as_slice());
        assert_eq!(reader.read_frame().unwrap().unwrap(), vec![0x11; 2084]);
        assert_eq!(reader.read_frame().unwrap().unwrap().len(), 0x1a0);
        assert_eq!(reader.read_frame().unwrap().unwrap().len(), MockFirmware::HEADER_LEN);
        assert_eq!(reader.read_frame().unwrap().unwrap().len(), 0x1000);
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn zero_transfer_aborts_send() {
        let (mut session, mut src) = running_source(0x2000);
        src.transfer_plan = VecDeque::from([4096, 0]);

        let mut sender = MigrationSender::new(Vec::new());
        sender.establish(&mut session, &mut src, &certs()).unwrap();
        let err = sender.stream(&mut src, 0x2000).unwrap_err();
        assert!(matches!(err, MigrationError::EmptyTransfer { offset: 0x1000 }));
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
        assert_eq!(src.count(SevCommand::SendUpdateData), 3);
    }

    #[test]
    fn zero_header_length_is_rejected() {
        let (mut session, mut src) = running_source(0x1000);
        src.header_len = 0;
        let mut sender = MigrationSender::new(Vec::new());
        sender.establish(&mut session, &mut src, &certs()).unwrap();
        let err = sender.stream(&mut src, 0x1000).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Sev(SevError::ZeroLength {
                command: SevCommand::SendUpdateData
            })
        ));
    }

    #[test]
    fn send_requires_running_guest() {
        let (mut session, mut fw) = initialized_sink(0x1000);
        let mut sender = MigrationSender::new(Vec::new());
        let err = sender.establish(&mut session, &mut fw, &certs()).unwrap_err();
        assert!(matches!(err, MigrationError::Sev(SevError::InvalidState { .. })));
        assert!(fw.commands().iter().all(|c| *c != SevCommand::SendStart));
    }

    #[test]
    fn firmware_failure_aborts_transfer() {
        let (mut session, mut src) = running_source(0x2000);
        src.fail_on = Some(SevCommand::SendUpdateData);
        let mut sender = MigrationSender::new(Vec::new());
        sender.establish(&mut session, &mut src, &certs()).unwrap();
        let err = sender.stream(&mut src, 0x2000).unwrap_err();
        assert_eq!(err.firmware_code(), Some(MockFirmware::FW_ERROR));
        assert_eq!(sender.into_inner().len(), 4 + 2084 + 4 + 0x1a0);
    }

    #[test]
    fn header_without_transfer_is_io_error() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_frame(&[1; 8]).unwrap();
        writer.write_frame(&[2; 8]).unwrap();
        writer.write_frame(&[3; 4]).unwrap();
        let stream = writer.into_inner();

        let (mut session, mut fw) = initialized_sink(0x1000);
        let mut receiver = MigrationReceiver::new(stream.as_slice());
        receiver.establish(&mut session, &mut fw).unwrap();
        assert_eq!(session.session_blob(), Some(&[2u8; 8][..]));
        let err = receiver.stream(&mut session, &mut fw, 0x1000).unwrap_err();
        assert!(matches!(err, MigrationError::Stream { op: "transfer read", .. }));
        assert_eq!(err.kind(), ErrorKind::IoError);
    }

    #[test]
    fn truncated_frame_is_io_error() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_frame(&[1; 8]).unwrap();
        writer.write_frame(&[2; 8]).unwrap();
        writer.write_frame(&[3; 4]).unwrap();
        writer.write_frame(&[4; 0x100]).unwrap();
        let mut stream = writer.into_inner();
        stream.truncate(stream.len() - 10);

        let (mut session, mut fw) = initialized_sink(0x1000);
        let err = receive_all(&mut session, &mut fw, 0x1000, stream.as_slice()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert_eq!(fw.count(SevCommand::ReceiveUpdateData), 0);
    }

    #[test]
    fn transfer_past_region_is_rejected() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_frame(&[1; 8]).unwrap();
        writer.write_frame(&[2; 8]).unwrap();
        writer.write_frame(&[3; 4]).unwrap();
        writer.write_frame(&[4; 0x1000]).unwrap();
        writer.write_frame(&[3; 4]).unwrap();
        writer.write_frame(&[4; 0x1000]).unwrap();
        let stream = writer.into_inner();

        let (mut session, mut fw) = initialized_sink(0x1800);
        let err = receive_all(&mut session, &mut fw, 0x1800, stream.as_slice()).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::OutOfBounds {
                offset: 0x1000,
                len: 0x1000,
                size: 0x1800
            }
        ));
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
        assert_eq!(fw.count(SevCommand::ReceiveUpdateData), 1);
    }

    #[test]
    fn missing_session_frame_is_io_error() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_frame(&[1; 8]).unwrap();
        let stream = writer.into_inner();

        let (mut session, mut fw) = initialized_sink(0x1000);
        let err = receive_all(&mut session, &mut fw, 0x1000, stream.as_slice()).unwrap_err();
        assert!(matches!(err, MigrationError::Stream { op: "session read", .. }));
        assert_eq!(fw.count(SevCommand::ReceiveStart), 0);
    }

    #[test]
    fn stream_out_of_order_is_rejected() {
        let (_, mut fw) = running_source(0x1000);
        let mut sender = MigrationSender::new(Vec::new());
        let err = sender.stream(&mut fw, 0x1000).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::InvalidState {
                expected: TransferState::SessionEstablished,
                actual: TransferState::Idle,
                ..
            }
        ));
    }
}
