//! Streaming frame reader and writer over `std::io`.

use std::io::{self, Read, Write};

use crate::{decode_prefix, encode_prefix, RecordKind, FRAME_PREFIX_LEN, MAX_FRAME_LEN};

/// Writes length-prefixed frames to an underlying sink.
pub struct FrameWriter<W: Write> {
    inner: W,
    frames: u64,
    bytes: u64,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            frames: 0,
            bytes: 0,
        }
    }

    /// Write one frame.
    ///
    /// Payloads longer than [`MAX_FRAME_LEN`] are refused with
    /// [`io::ErrorKind::InvalidInput`] before anything is written, so every
    /// stream this writer produces is readable by [`FrameReader`].  A short
    /// write of either the prefix or the payload surfaces as the
    /// underlying `io::Error` (`WriteZero` for a sink that stops
    /// accepting bytes).
    pub fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} frame of {} bytes exceeds {MAX_FRAME_LEN}",
                    self.next_kind().name(),
                    payload.len()
                ),
            ));
        }
        let len = payload.len() as u32;

        self.inner.write_all(&encode_prefix(len))?;
        self.inner.write_all(payload)?;

        self.frames += 1;
        self.bytes += (FRAME_PREFIX_LEN + payload.len()) as u64;
        Ok(())
    }

    /// Kind of the next frame this writer will produce.
    pub fn next_kind(&self) -> RecordKind {
        RecordKind::at(self.frames)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    /// Number of frames written so far.
    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    /// Total bytes written so far, prefixes included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads length-prefixed frames from an underlying source.
pub struct FrameReader<R: Read> {
    inner: R,
    frames: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, frames: 0 }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the source is exhausted exactly at a frame
    /// boundary.  A partially read prefix or payload is an
    /// [`io::ErrorKind::UnexpectedEof`] error, and a prefix larger than
    /// [`MAX_FRAME_LEN`] is [`io::ErrorKind::InvalidData`].
    pub fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        let mut filled = 0;
        while filled < FRAME_PREFIX_LEN {
            match self.inner.read(&mut prefix[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        if filled < FRAME_PREFIX_LEN {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "truncated {} prefix: {filled} of {FRAME_PREFIX_LEN} bytes",
                    self.next_kind().name()
                ),
            ));
        }

        let len = decode_prefix(prefix) as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} frame length {len} exceeds {MAX_FRAME_LEN}",
                    self.next_kind().name()
                ),
            ));
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload)?;
        self.frames += 1;
        Ok(Some(payload))
    }

    /// Read a frame that must be present.
    ///
    /// End of stream is reported as [`io::ErrorKind::UnexpectedEof`].
    pub fn read_required(&mut self) -> io::Result<Vec<u8>> {
        let kind = self.next_kind();
        self.read_frame()?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended before the {} frame", kind.name()),
            )
        })
    }

    /// Kind of the next frame this reader expects.
    pub fn next_kind(&self) -> RecordKind {
        RecordKind::at(self.frames)
    }

    /// Number of complete frames read so far.
    pub fn frames_read(&self) -> u64 {
        self.frames
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
