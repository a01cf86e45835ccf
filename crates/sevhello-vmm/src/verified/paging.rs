//! Page-table entry encoding for the two paged guest modes.
//!
//! | Mode    | Tables                 | Leaf                      |
//! |---------|------------------------|---------------------------|
//! | Paged32 | PD                     | 4 MiB PSE page, 32-bit    |
//! | Long    | PML4 → PDPT → PD       | 2 MiB page, 64-bit        |
//!
//! With SEV active the 64-bit leaf additionally carries the C-bit at the
//! position the host reports.  A 32-bit entry has no room for it.

/// Size of one page-table page.
pub const PAGE_SIZE: u64 = 0x1000;

pub const PTE_PRESENT: u64 = 1 << 0;
pub const PTE_WRITABLE: u64 = 1 << 1;
pub const PTE_USER: u64 = 1 << 2;
/// Page-size bit: the entry maps a large page instead of a table.
pub const PTE_PAGE_SIZE: u64 = 1 << 7;

/// Flags on a non-leaf entry.
pub const TABLE_ENTRY_FLAGS: u64 = PTE_PRESENT | PTE_WRITABLE | PTE_USER;

/// Flags on a large-page leaf entry.
pub const LARGE_PAGE_FLAGS: u64 = TABLE_ENTRY_FLAGS | PTE_PAGE_SIZE;

/// Entries per 64-bit table.
pub const ENTRIES_PER_TABLE_64: usize = 512;

/// Entries per 32-bit page directory.
pub const ENTRIES_PER_TABLE_32: usize = 1024;

/// Large page size under PAE / long mode.
pub const LARGE_PAGE_64: u64 = 1 << 21;

/// Large page size under 32-bit PSE paging.
pub const LARGE_PAGE_32: u64 = 1 << 22;

/// Physical-address bits of a 64-bit entry (bits 51:12).
pub const ADDRESS_MASK_64: u64 = 0x000f_ffff_ffff_f000;

/// Base bits of a 32-bit 4 MiB entry (bits 31:22).
pub const LARGE_PAGE_MASK_32: u32 = 0xffc0_0000;

/// Lowest C-bit position accepted from the host.
pub const C_BIT_MIN: u32 = 32;

/// Highest C-bit position accepted from the host (MAXPHYADDR is 52).
pub const C_BIT_MAX: u32 = 51;

const _: () = assert!(LARGE_PAGE_FLAGS == 0x87);
const _: () = assert!(TABLE_ENTRY_FLAGS == 0x07);
const _: () = assert!(ADDRESS_MASK_64 & 0xfff == 0);
const _: () = assert!(C_BIT_MIN > 31 && C_BIT_MAX < 52);

/// Whether `position` is a plausible encryption-bit position.
pub const fn c_bit_is_valid(position: u32) -> bool {
    position >= C_BIT_MIN && position <= C_BIT_MAX
}

/// Mask for the encryption bit, or 0 when encryption is off.
pub fn c_bit_mask(c_bit: Option<u32>) -> u64 {
    match c_bit {
        Some(position) => {
            debug_assert!(c_bit_is_valid(position), "C-bit {position} out of range");
            1u64 << position
        }
        None => 0,
    }
}

/// Non-leaf 64-bit entry pointing at the table at `next_table`.
pub fn table_entry(next_table: u64) -> u64 {
    debug_assert!(next_table % PAGE_SIZE == 0, "table must be page aligned");
    debug_assert!(next_table & !ADDRESS_MASK_64 == 0);

    let entry = next_table | TABLE_ENTRY_FLAGS;

    debug_assert!(entry_base_64(entry, None) == next_table);
    entry
}

/// 2 MiB leaf entry mapping `base`, tagged with the C-bit when given.
pub fn large_page_entry_64(base: u64, c_bit: Option<u32>) -> u64 {
    debug_assert!(base % LARGE_PAGE_64 == 0, "2 MiB page must be aligned");

    let entry = base | LARGE_PAGE_FLAGS | c_bit_mask(c_bit);

    debug_assert!(entry_is_present(entry));
    debug_assert!(entry_base_64(entry, c_bit) == base);
    entry
}

/// 4 MiB PSE leaf entry mapping `base`.
pub fn large_page_entry_32(base: u32) -> u32 {
    debug_assert!(u64::from(base) % LARGE_PAGE_32 == 0, "4 MiB page must be aligned");

    let entry = base | LARGE_PAGE_FLAGS as u32;

    debug_assert!(entry_base_32(entry) == base);
    entry
}

#[inline]
pub fn entry_is_present(entry: u64) -> bool {
    entry & PTE_PRESENT != 0
}

/// Physical base of a 64-bit entry with status bits and the C-bit removed.
pub fn entry_base_64(entry: u64, c_bit: Option<u32>) -> u64 {
    entry & ADDRESS_MASK_64 & !c_bit_mask(c_bit)
}

/// Physical base of a 32-bit 4 MiB entry.
pub fn entry_base_32(entry: u32) -> u32 {
    entry & LARGE_PAGE_MASK_32
}

/// Number of present entries in a table.
pub fn present_count(entries: impl IntoIterator<Item = u64>) -> usize {
    entries.into_iter().filter(|e| entry_is_present(*e)).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_entry_flags() {
        assert_eq!(table_entry(0x3000), 0x3007);
        assert_eq!(table_entry(0x4000), 0x4007);
    }

    #[test]
    fn leaf_without_c_bit() {
        assert_eq!(large_page_entry_64(0, None), 0x87);
        assert_eq!(large_page_entry_32(0), 0x87);
    }

    #[test]
    fn leaf_with_c_bit_decodes_to_base() {
        for position in [47, 51] {
            let entry = large_page_entry_64(0, Some(position));
            assert_eq!(entry, 0x87 | (1 << position));
            assert_eq!(entry_base_64(entry, Some(position)), 0);
            // Without knowing the C-bit, it reads as an address bit.
            assert_eq!(entry_base_64(entry, None), 1 << position);
        }
    }

    #[test]
    fn leaf_with_nonzero_base() {
        let entry = large_page_entry_64(3 * LARGE_PAGE_64, Some(47));
        assert_eq!(entry_base_64(entry, Some(47)), 3 * LARGE_PAGE_64);

        let entry = large_page_entry_32(0x0040_0000);
        assert_eq!(entry_base_32(entry), 0x0040_0000);
    }

    #[test]
    fn c_bit_range() {
        assert!(!c_bit_is_valid(0));
        assert!(!c_bit_is_valid(31));
        assert!(c_bit_is_valid(47));
        assert!(c_bit_is_valid(51));
        assert!(!c_bit_is_valid(52));
        assert_eq!(c_bit_mask(None), 0);
    }

    #[test]
    fn present_count_ignores_zero_entries() {
        let mut table = [0u64; ENTRIES_PER_TABLE_64];
        assert_eq!(present_count(table), 0);
        table[0] = table_entry(0x3000);
        assert_eq!(present_count(table), 1);
        table[7] = 0x1000; // address without P
        assert_eq!(present_count(table), 1);
    }
}
