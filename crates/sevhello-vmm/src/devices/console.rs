//! Debug console on I/O port `0xE9`.
//!
//! Every byte the guest writes to the port is forwarded to the host writer
//! and flushed immediately.  Reads always return zero.  A copy of all
//! output is kept so the run can be checked after the guest halts.

use std::io::{self, Write};

pub use sevhello_protocol::CONSOLE_PORT;

pub struct Console<W: Write> {
    out: W,
    transcript: Vec<u8>,
    reads: u64,
}

impl<W: Write> Console<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            transcript: Vec::new(),
            reads: 0,
        }
    }

    #[inline]
    pub fn handles(&self, port: u16) -> bool {
        port == CONSOLE_PORT
    }

    /// Guest `out` to the console port.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.out.write_all(data)?;
        self.out.flush()?;
        self.transcript.extend_from_slice(data);
        Ok(())
    }

    /// Guest `in` from the console port.
    pub fn read(&mut self, data: &mut [u8]) {
        data.fill(0);
        self.reads += 1;
    }

    /// Everything the guest has written so far.
    pub fn transcript(&self) -> &[u8] {
        &self.transcript
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn into_transcript(self) -> Vec<u8> {
        self.transcript
    }
}
