//! Offset arithmetic for chunked memory export/import and result-slot
//! decoding.

/// Largest value representable in `width` bytes.
pub fn width_mask(width: usize) -> u64 {
    debug_assert!((1..=8).contains(&width), "width {width} out of range");
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

/// Sentinel seeded into the result slot before the guest runs.
///
/// All ones at the check width, so an untouched slot never reads as a
/// valid result.
pub fn slot_sentinel(width: usize) -> u64 {
    width_mask(width)
}

/// Decode a little-endian value of `width` bytes from the start of `bytes`.
pub fn decode_slot(bytes: &[u8], width: usize) -> Option<u64> {
    let raw = bytes.get(..width)?;
    let mut wide = [0u8; 8];
    wide[..width].copy_from_slice(raw);
    let value = u64::from_le_bytes(wide);

    debug_assert!(value <= width_mask(width));
    Some(value)
}

/// Length of the chunk starting at `offset` in a region of `region_size`
/// bytes.  The last chunk is shortened when the region size is not a
/// multiple of `nominal`.
pub fn chunk_len(offset: u64, region_size: u64, nominal: u64) -> u64 {
    debug_assert!(offset < region_size, "offset past the region");
    debug_assert!(nominal > 0);

    let len = nominal.min(region_size - offset);

    debug_assert!(len > 0 && offset + len <= region_size);
    len
}

/// Offset of the next chunk after `transferred` bytes were placed at
/// `offset`, or `None` if that would step outside the region.
pub fn advance(offset: u64, transferred: u64, region_size: u64) -> Option<u64> {
    let next = offset.checked_add(transferred)?;
    if transferred == 0 || next > region_size {
        return None;
    }
    Some(next)
}

/// Number of nominal chunks needed to cover `region_size` bytes.
pub fn chunk_count(region_size: u64, nominal: u64) -> u64 {
    debug_assert!(nominal > 0);
    region_size.div_ceil(nominal)
}
