//! Guest payloads.
//!
//! The built-in programs are the same routine assembled for 16-, 32- and
//! 64-bit code: read the console once, print the greeting through port
//! `0xE9`, store 42 at the data slot using the mode's width, load 42 into
//! the accumulator and halt.  They are position dependent and expect to
//! be loaded at guest-physical 0 with the greeting right after the code.

use std::fs;
use std::path::Path;

use sevhello_protocol::GREETING;

use crate::config::PrivilegeMode;
use crate::memory::{MemoryError, MAX_IMAGE_SIZE};
use crate::vm::VmError;

/// ```text
/// 00  in    al, 0xe9
/// 02  mov   si, 0x19
/// 05  mov   cx, 14
/// 08  lodsb
/// 09  out   0xe9, al
/// 0b  loop  0x08
/// 0d  mov   word [0x400], 42
/// 13  mov   ax, 42
/// 16  hlt
/// 17  jmp   0x16
/// ```
const REAL_CODE: [u8; 0x19] = [
    0xe4, 0xe9, //
    0xbe, 0x19, 0x00, //
    0xb9, 0x0e, 0x00, //
    0xac, //
    0xe6, 0xe9, //
    0xe2, 0xfb, //
    0xc7, 0x06, 0x00, 0x04, 0x2a, 0x00, //
    0xb8, 0x2a, 0x00, //
    0xf4, //
    0xeb, 0xfd,
];

/// Shared by protected and paged32 mode.
///
/// ```text
/// 00  in    al, 0xe9
/// 02  mov   esi, 0x23
/// 07  mov   ecx, 14
/// 0c  lodsb
/// 0d  out   0xe9, al
/// 0f  loop  0x0c
/// 11  mov   dword [0x400], 42
/// 1b  mov   eax, 42
/// 20  hlt
/// 21  jmp   0x20
/// ```
const PROTECTED_CODE: [u8; 0x23] = [
    0xe4, 0xe9, //
    0xbe, 0x23, 0x00, 0x00, 0x00, //
    0xb9, 0x0e, 0x00, 0x00, 0x00, //
    0xac, //
    0xe6, 0xe9, //
    0xe2, 0xfb, //
    0xc7, 0x05, 0x00, 0x04, 0x00, 0x00, 0x2a, 0x00, 0x00, 0x00, //
    0xb8, 0x2a, 0x00, 0x00, 0x00, //
    0xf4, //
    0xeb, 0xfd,
];

/// ```text
/// 00  in    al, 0xe9
/// 02  mov   esi, 0x25
/// 07  mov   ecx, 14
/// 0c  lodsb
/// 0d  out   0xe9, al
/// 0f  loop  0x0c
/// 11  mov   qword [0x400], 42
/// 1d  mov   eax, 42
/// 22  hlt
/// 23  jmp   0x22
/// ```
const LONG_CODE: [u8; 0x25] = [
    0xe4, 0xe9, //
    0xbe, 0x25, 0x00, 0x00, 0x00, //
    0xb9, 0x0e, 0x00, 0x00, 0x00, //
    0xac, //
    0xe6, 0xe9, //
    0xe2, 0xfb, //
    0x48, 0xc7, 0x04, 0x25, 0x00, 0x04, 0x00, 0x00, 0x2a, 0x00, 0x00, 0x00, //
    0xb8, 0x2a, 0x00, 0x00, 0x00, //
    0xf4, //
    0xeb, 0xfd,
];

const _: () = assert!(GREETING.len() == 14);
const _: () = assert!(LONG_CODE.len() + GREETING.len() <= MAX_IMAGE_SIZE);

/// Bytes copied to guest-physical 0; execution starts at the first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestImage {
    bytes: Vec<u8>,
}

impl GuestImage {
    /// The built-in program for `mode`.
    pub fn for_mode(mode: PrivilegeMode) -> Self {
        let code: &[u8] = match mode {
            PrivilegeMode::Real => &REAL_CODE,
            PrivilegeMode::Protected | PrivilegeMode::Paged32 => &PROTECTED_CODE,
            PrivilegeMode::Long => &LONG_CODE,
        };
        let mut bytes = Vec::with_capacity(code.len() + GREETING.len());
        bytes.extend_from_slice(code);
        bytes.extend_from_slice(GREETING);
        Self { bytes }
    }

    /// A flat binary from disk, entry point at its first byte.
    pub fn from_file(path: &Path) -> Result<Self, VmError> {
        let bytes = fs::read(path).map_err(|source| VmError::GuestImage {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, VmError> {
        if bytes.len() > MAX_IMAGE_SIZE {
            return Err(MemoryError::ImageTooLarge { len: bytes.len() }.into());
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
