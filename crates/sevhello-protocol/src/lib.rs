//! Shared guest ABI and migration stream format for sevhello.
//!
//! This crate defines the fixed addresses and ports the guest payloads
//! rely on, and the length-prefixed framing used by the encrypted-memory
//! migration file.  It is `no_std`-compatible with zero dependencies; the
//! `std` feature adds the streaming [`FrameWriter`] and [`FrameReader`].
//!
//! # Migration stream
//!
//! A migration file is a flat sequence of frames, each a 4-byte
//! little-endian length followed by that many bytes:
//!
//! ```text
//! ┌──────┬─────────────┬──────┬─────────────┐
//! │ len  │ local PDH   │ len  │ session     │
//! ├──────┼─────────────┼──────┼─────────────┤
//! │ len  │ header 0    │ len  │ transfer 0  │
//! │ len  │ header 1    │ len  │ transfer 1  │
//! │  …   │             │  …   │             │
//! └──────┴─────────────┴──────┴─────────────┘
//! ```
//!
//! There is no magic number, trailer, or checksum.  The stream ends when
//! the next length prefix cannot be read at all.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
mod stream;

#[cfg(feature = "std")]
pub use stream::{FrameReader, FrameWriter};

// ═══════════════════════════════════════════════════════════════════════
//  Guest ABI
// ═══════════════════════════════════════════════════════════════════════

/// I/O port of the debug console.
///
/// `out` writes a byte to the host console, `in` always reads zero.
pub const CONSOLE_PORT: u16 = 0xE9;

/// Guest-physical address of the result slot the guest writes before
/// halting.
pub const DATA_SLOT_ADDR: u64 = 0x400;

/// Value a well-behaved guest leaves in RAX and in the result slot.
pub const EXPECTED_RESULT: u64 = 42;

/// Console output expected from every built-in guest.
pub const GREETING: &[u8] = b"Hello, world!\n";

// ═══════════════════════════════════════════════════════════════════════
//  Migration framing
// ═══════════════════════════════════════════════════════════════════════

/// Default file name of the migration stream.
pub const DEFAULT_MIGRATION_FILE: &str = "encrypted_mem.dat";

/// Nominal amount of guest memory exported per send-update call.
pub const MIGRATION_CHUNK_SIZE: usize = 4096;

/// Size of the length prefix in front of every frame.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Upper bound on a single frame payload accepted by [`FrameReader`].
///
/// Real frames are certificates, session blobs, packet headers, and
/// transfer buffers of roughly [`MIGRATION_CHUNK_SIZE`] bytes.  Anything
/// much larger is a corrupt prefix.
pub const MAX_FRAME_LEN: usize = 1 << 20;

const _: () = assert!(MIGRATION_CHUNK_SIZE.is_power_of_two());
const _: () = assert!(MAX_FRAME_LEN >= MIGRATION_CHUNK_SIZE);
const _: () = assert!(GREETING.len() == 14);

/// Encode a frame length prefix.
#[inline]
pub const fn encode_prefix(len: u32) -> [u8; FRAME_PREFIX_LEN] {
    len.to_le_bytes()
}

/// Decode a frame length prefix.
#[inline]
pub const fn decode_prefix(prefix: [u8; FRAME_PREFIX_LEN]) -> u32 {
    u32::from_le_bytes(prefix)
}

/// Role of a frame, determined only by its position in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// The sender's platform Diffie-Hellman certificate.
    LocalCertificate,
    /// Session blob produced by `SEND_START`.
    Session,
    /// Packet header of one exported chunk.
    ChunkHeader,
    /// Encrypted transfer buffer of one exported chunk.
    ChunkTransfer,
}

impl RecordKind {
    /// Kind of the frame at zero-based position `index`.
    pub const fn at(index: u64) -> Self {
        match index {
            0 => RecordKind::LocalCertificate,
            1 => RecordKind::Session,
            i if i % 2 == 0 => RecordKind::ChunkHeader,
            _ => RecordKind::ChunkTransfer,
        }
    }

    /// Short lowercase name used in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            RecordKind::LocalCertificate => "local certificate",
            RecordKind::Session => "session",
            RecordKind::ChunkHeader => "chunk header",
            RecordKind::ChunkTransfer => "chunk transfer",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_little_endian() {
        assert_eq!(encode_prefix(0x0102_0304), [0x04, 0x03, 0x02, 0x01]);
        assert_eq!(decode_prefix([0x10, 0x00, 0x00, 0x00]), 16);
    }

    #[test]
    fn prefix_extremes() {
        assert_eq!(decode_prefix(encode_prefix(0)), 0);
        assert_eq!(decode_prefix(encode_prefix(u32::MAX)), u32::MAX);
    }

    #[test]
    fn record_order() {
        assert_eq!(RecordKind::at(0), RecordKind::LocalCertificate);
        assert_eq!(RecordKind::at(1), RecordKind::Session);
        assert_eq!(RecordKind::at(2), RecordKind::ChunkHeader);
        assert_eq!(RecordKind::at(3), RecordKind::ChunkTransfer);
        assert_eq!(RecordKind::at(1000), RecordKind::ChunkHeader);
        assert_eq!(RecordKind::at(1001), RecordKind::ChunkTransfer);
    }

    #[test]
    fn data_slot_sits_below_first_page_end() {
        assert!(DATA_SLOT_ADDR + 8 <= MIGRATION_CHUNK_SIZE as u64);
    }
}
