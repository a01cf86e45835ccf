//! Guest physical memory for the sevhello VMM.
//!
//! A single anonymous, zero-filled mapping backs guest-physical
//! `0..size`.  [`GuestMemoryManager`] owns it and is the only way the rest
//! of the crate touches guest bytes: every access is bounds-checked
//! against the region and fails with a typed [`MemoryError`] instead of
//! writing past the mapping.
//!
//! # Guest Physical Memory Layout
//!
//! ```text
//! 0x0000_0000  ┌───────────────────────────┐
//!              │  Guest image (entry = 0)   │
//! 0x0000_0400  ├───────────────────────────┤
//!              │  Result slot (≤ 8 bytes)   │
//! 0x0000_2000  ├───────────────────────────┤
//!              │  PD (paged32) / PML4 (long)│
//! 0x0000_3000  ├───────────────────────────┤
//!              │  PDPT (long)               │
//! 0x0000_4000  ├───────────────────────────┤
//!              │  PD (long)                 │
//! 0x0000_5000  ├───────────────────────────┤
//!              │  ...                       │
//!              │  Stack (long, grows down)  │
//! 0x0020_0000  └───────────────────────────┘  ← default region end (2 MiB)
//! ```

use log::{info, warn};
use thiserror::Error;
use vm_memory::{ByteValued, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use crate::verified::paging::{ENTRIES_PER_TABLE_32, ENTRIES_PER_TABLE_64, PAGE_SIZE};
use crate::verified::transfer;
use crate::vm::ErrorKind;

// ═══════════════════════════════════════════════════════════════════════
//  Memory layout constants
// ═══════════════════════════════════════════════════════════════════════

/// Default guest RAM size (2 MiB).
pub const DEFAULT_MEMORY_SIZE: usize = 0x20_0000;

/// Guest-physical address the image is copied to and executed from.
pub const GUEST_IMAGE_START: u64 = 0;

/// Result slot the guest writes before halting.
pub const DATA_SLOT_ADDR: u64 = sevhello_protocol::DATA_SLOT_ADDR;

/// Largest guest image that fits below the result slot.
pub const MAX_IMAGE_SIZE: usize = (DATA_SLOT_ADDR - GUEST_IMAGE_START) as usize;

/// Root page table: the page directory in paged32 mode, the PML4 in
/// long mode.  `CR3` is loaded with this value.
pub const PAGE_TABLE_ROOT: u64 = 0x2000;

/// Page-directory-pointer table (long mode only).
pub const PDPT_START: u64 = 0x3000;

/// Page directory (long mode only).
pub const PD_START: u64 = 0x4000;

/// First byte after the fixed layout.
pub const LAYOUT_END: u64 = PD_START + PAGE_SIZE;

/// Initial stack pointer in long mode (2 MiB).
pub const LONG_MODE_STACK_TOP: u64 = 2 << 20;

/// Bytes shown by [`GuestMemoryManager::dump`] diagnostics.
pub const DUMP_LEN: usize = 256;

const _: () = assert!(GUEST_IMAGE_START < DATA_SLOT_ADDR);
const _: () = assert!(DATA_SLOT_ADDR + 8 <= PAGE_TABLE_ROOT);
const _: () = assert!(PAGE_TABLE_ROOT < PDPT_START);
const _: () = assert!(PDPT_START < PD_START);
const _: () = assert!(PAGE_TABLE_ROOT % PAGE_SIZE == 0);
const _: () = assert!(PDPT_START % PAGE_SIZE == 0);
const _: () = assert!(PD_START % PAGE_SIZE == 0);
// A full 32-bit page directory fits in one page as well.
const _: () = assert!((ENTRIES_PER_TABLE_32 * 4) as u64 == PAGE_SIZE);
const _: () = assert!((ENTRIES_PER_TABLE_64 * 8) as u64 == PAGE_SIZE);
const _: () = assert!(LAYOUT_END <= LONG_MODE_STACK_TOP);
const _: () = assert!(LONG_MODE_STACK_TOP <= DEFAULT_MEMORY_SIZE as u64);

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Errors that can occur during guest memory operations.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The anonymous mapping could not be created.
    #[error("Failed to map {size} bytes of guest memory")]
    Create { size: usize },

    /// The requested size cannot hold the fixed layout.
    #[error("Guest memory of {size:#x} bytes is smaller than the layout end {LAYOUT_END:#x}")]
    TooSmall { size: usize },

    /// The requested size is not a whole number of pages.
    #[error("Guest memory size {size:#x} is not a multiple of the page size")]
    Unaligned { size: usize },

    /// An access would fall outside the region.
    #[error("Guest range {address:#x}+{len:#x} is outside the {size:#x}-byte region")]
    OutOfBounds { address: u64, len: usize, size: usize },

    #[error("Failed to write to guest memory at {address:#x}")]
    Write { address: u64 },

    #[error("Failed to read from guest memory at {address:#x}")]
    Read { address: u64 },

    /// The guest image overlaps the result slot.
    #[error("Guest image of {len} bytes exceeds the {MAX_IMAGE_SIZE}-byte image area")]
    ImageTooLarge { len: usize },

    /// The host virtual address for a guest address could not be resolved.
    #[error("Failed to resolve host address for guest address {address:#x}")]
    HostAddress { address: u64 },
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::Create { .. } => ErrorKind::ResourceExhausted,
            _ => ErrorKind::ProtocolError,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  GuestMemoryManager
// ═══════════════════════════════════════════════════════════════════════

/// Owns the guest RAM mapping and mediates every access to it.
///
/// The mapping is released when the manager is dropped.  Writes go
/// through `vm-memory`'s interior mutability, so the write methods take
/// `&self`.
pub struct GuestMemoryManager {
    memory: GuestMemoryMmap,
    size: usize,
}

impl GuestMemoryManager {
    /// Map `size` bytes of zeroed guest memory at guest-physical 0.
    ///
    /// The mapping is marked `MADV_MERGEABLE` so identical guest pages can
    /// be shared by KSM.  A host that refuses the advice only gets a
    /// warning.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if (size as u64) < LAYOUT_END {
            return Err(MemoryError::TooSmall { size });
        }
        if size as u64 % PAGE_SIZE != 0 {
            return Err(MemoryError::Unaligned { size });
        }

        let regions = [(GuestAddress(0), size)];
        let memory =
            GuestMemoryMmap::from_ranges(&regions).map_err(|_| MemoryError::Create { size })?;
        let manager = Self { memory, size };

        manager.advise_mergeable()?;

        info!(
            "Guest memory created: {} KiB at {:#x}",
            size / 1024,
            manager.host_address()?,
        );

        Ok(manager)
    }

    fn advise_mergeable(&self) -> Result<(), MemoryError> {
        let addr = self.host_address()?;
        // SAFETY: the range is exactly the mapping owned by `self.memory`;
        // madvise does not change its contents.
        let rc = unsafe { libc::madvise(addr as *mut libc::c_void, self.size, libc::MADV_MERGEABLE) };
        if rc != 0 {
            warn!(
                "madvise(MADV_MERGEABLE) refused: {}",
                std::io::Error::last_os_error()
            );
        }
        Ok(())
    }

    fn check_range(&self, address: u64, len: usize) -> Result<(), MemoryError> {
        let end = address.checked_add(len as u64);
        match end {
            Some(end) if end <= self.size as u64 => Ok(()),
            _ => Err(MemoryError::OutOfBounds {
                address,
                len,
                size: self.size,
            }),
        }
    }

    /// Copy `bytes` into guest memory at `address`.
    pub fn write_bytes(&self, address: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        self.check_range(address, bytes.len())?;
        self.memory
            .write_slice(bytes, GuestAddress(address))
            .map_err(|_| MemoryError::Write { address })
    }

    /// Fill `buf` from guest memory at `address`.
    pub fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.check_range(address, buf.len())?;
        self.memory
            .read_slice(buf, GuestAddress(address))
            .map_err(|_| MemoryError::Read { address })
    }

    /// Store a plain value at `address` in guest byte order.
    pub fn write_obj<T: ByteValued>(&self, value: T, address: u64) -> Result<(), MemoryError> {
        self.check_range(address, std::mem::size_of::<T>())?;
        self.memory
            .write_obj(value, GuestAddress(address))
            .map_err(|_| MemoryError::Write { address })
    }

    /// Load a plain value from `address`.
    pub fn read_obj<T: ByteValued>(&self, address: u64) -> Result<T, MemoryError> {
        self.check_range(address, std::mem::size_of::<T>())?;
        self.memory
            .read_obj(GuestAddress(address))
            .map_err(|_| MemoryError::Read { address })
    }

    /// Copy the guest image to [`GUEST_IMAGE_START`].
    pub fn load_image(&self, image: &[u8]) -> Result<(), MemoryError> {
        if image.len() > MAX_IMAGE_SIZE {
            return Err(MemoryError::ImageTooLarge { len: image.len() });
        }
        self.write_bytes(GUEST_IMAGE_START, image)?;
        info!("Guest image loaded: {} bytes at {:#x}", image.len(), GUEST_IMAGE_START);
        Ok(())
    }

    /// Store `value` in the result slot, truncated to `width` bytes.
    pub fn write_data_slot(&self, value: u64, width: usize) -> Result<(), MemoryError> {
        let bytes = (value & transfer::width_mask(width)).to_le_bytes();
        self.write_bytes(DATA_SLOT_ADDR, &bytes[..width])
    }

    /// Read the result slot as a `width`-byte little-endian value.
    pub fn read_data_slot(&self, width: usize) -> Result<u64, MemoryError> {
        let mut bytes = [0u8; 8];
        self.read_bytes(DATA_SLOT_ADDR, &mut bytes[..width])?;
        transfer::decode_slot(&bytes, width).ok_or(MemoryError::Read {
            address: DATA_SLOT_ADDR,
        })
    }

    /// Copy of the first `len` bytes of guest memory.
    pub fn dump(&self, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut data = vec![0u8; len.min(self.size)];
        self.read_bytes(0, &mut data)?;
        Ok(data)
    }

    /// Host virtual address of guest-physical 0, for KVM slot setup.
    pub fn host_address(&self) -> Result<u64, MemoryError> {
        self.host_range(0, self.size)
    }

    /// Host virtual address backing `address..address + len`.
    ///
    /// The range is checked against the region first, so the returned
    /// pointer can be handed to the kernel for exactly `len` bytes.
    pub fn host_range(&self, address: u64, len: usize) -> Result<u64, MemoryError> {
        self.check_range(address, len)?;
        self.memory
            .get_host_address(GuestAddress(address))
            .map(|ptr| ptr as u64)
            .map_err(|_| MemoryError::HostAddress { address })
    }

    /// Underlying `vm-memory` mapping.
    #[inline]
    pub fn inner(&self) -> &GuestMemoryMmap {
        &self.memory
    }

    /// Total size of the guest memory in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Render `bytes` as 16-byte hex lines prefixed with their offset.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3 + bytes.len() / 16 * 8);
    for (line, chunk) in bytes.chunks(16).enumerate() {
        out.push_str(&format!("{:04x}:", line * 16));
        for byte in chunk {
            out.push_str(&format!(" {byte:02x}"));
        }
        out.push('\n');
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_default_region() {
        let mem = GuestMemoryManager::new(DEFAULT_MEMORY_SIZE).unwrap();
        assert_eq!(mem.size(), DEFAULT_MEMORY_SIZE);
        assert_eq!(mem.inner().num_regions(), 1);
        assert_ne!(mem.host_address().unwrap(), 0);
    }

    #[test]
    fn memory_starts_zeroed() {
        let mem = GuestMemoryManager::new(DEFAULT_MEMORY_SIZE).unwrap();
        let page = mem.dump(4096).unwrap();
        assert!(page.iter().all(|b| *b == 0));
    }

    #[test]
    fn rejects_tiny_and_unaligned_sizes() {
        assert!(matches!(
            GuestMemoryManager::new(0x1000),
            Err(MemoryError::TooSmall { size: 0x1000 })
        ));
        assert!(matches!(
            GuestMemoryManager::new(DEFAULT_MEMORY_SIZE + 1),
            Err(MemoryError::Unaligned { .. })
        ));
    }

    #[test]
    fn typed_access_roundtrip() {
        let mem = GuestMemoryManager::new(DEFAULT_MEMORY_SIZE).unwrap();
        mem.write_obj(0xdead_beef_u32, 0x1000).unwrap();
        assert_eq!(mem.read_obj::<u32>(0x1000).unwrap(), 0xdead_beef);
        assert_eq!(mem.read_obj::<u8>(0x1000).unwrap(), 0xef);
    }

    #[test]
    fn accesses_past_the_end_are_refused() {
        let mem = GuestMemoryManager::new(DEFAULT_MEMORY_SIZE).unwrap();
        let end = DEFAULT_MEMORY_SIZE as u64;

        assert!(mem.write_obj(1u64, end - 8).is_ok());
        assert!(matches!(
            mem.write_obj(1u64, end - 4),
            Err(MemoryError::OutOfBounds { .. })
        ));
        assert!(matches!(
            mem.read_bytes(u64::MAX, &mut [0u8; 2]),
            Err(MemoryError::OutOfBounds { .. })
        ));
        assert!(mem.host_range(end, 1).is_err());
        assert!(mem.host_range(end - 4096, 4096).is_ok());
    }

    #[test]
    fn image_is_bounded_by_data_slot() {
        let mem = GuestMemoryManager::new(DEFAULT_MEMORY_SIZE).unwrap();
        mem.load_image(&[0xf4; MAX_IMAGE_SIZE]).unwrap();
        let err = mem.load_image(&[0xf4; MAX_IMAGE_SIZE + 1]).unwrap_err();
        assert!(matches!(err, MemoryError::ImageTooLarge { .. }));
    }

    #[test]
    fn data_slot_respects_width() {
        let mem = GuestMemoryManager::new(DEFAULT_MEMORY_SIZE).unwrap();
        mem.write_data_slot(u64::MAX, 8).unwrap();
        mem.write_data_slot(42, 4).unwrap();

        assert_eq!(mem.read_data_slot(2).unwrap(), 42);
        assert_eq!(mem.read_data_slot(4).unwrap(), 42);
        assert_eq!(mem.read_data_slot(8).unwrap(), 0xffff_ffff_0000_002a);
    }

    #[test]
    fn hex_dump_format() {
        let bytes: Vec<u8> = (0..20).collect();
        let dump = hex_dump(&bytes);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000: 00 01 02"));
        assert_eq!(lines[1], "0010: 10 11 12 13");
    }

    #[test]
    fn error_kinds() {
        assert_eq!(MemoryError::Create { size: 1 }.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(
            MemoryError::Write { address: 0 }.kind(),
            ErrorKind::ProtocolError
        );
    }
}
