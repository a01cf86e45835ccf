//! x86 segment descriptor encoding.
//!
//! The guest never loads a GDT; KVM takes segment state directly through
//! `kvm_sregs`.  Descriptors are still built in their architectural
//! 8-byte form and decoded field by field so the register values follow
//! the same encoding a real GDT would carry.
//!
//! ```text
//! 63      56 55 54 53 52 51   48 47 46 45 44 43  40 39          16 15         0
//! ┌─────────┬──┬──┬──┬──┬───────┬──┬─────┬──┬──────┬──────────────┬────────────┐
//! │base31:24│G │DB│L │AV│lim19:16│P │ DPL │S │ type │  base 23:0   │ limit 15:0 │
//! └─────────┴──┴──┴──┴──┴───────┴──┴─────┴──┴──────┴──────────────┴────────────┘
//! ```

/// Flat 32-bit code: G=1, D=1, present, ring 0, execute/read, accessed.
pub const FLAGS_CODE32: u16 = 0xc09b;

/// Flat 64-bit code: G=1, L=1, present, ring 0, execute/read, accessed.
pub const FLAGS_CODE64: u16 = 0xa09b;

/// Flat data: G=1, B=1, present, ring 0, read/write, accessed.
pub const FLAGS_DATA: u16 = 0xc093;

/// 20-bit limit that, with G=1, covers the whole 4 GiB space.
pub const FLAT_LIMIT: u32 = 0xfffff;

const _: () = assert!(FLAGS_CODE32 & 0x0f00 == 0);
const _: () = assert!(FLAGS_CODE64 & 0x0f00 == 0);
const _: () = assert!(FLAGS_DATA & 0x0f00 == 0);
// Code type 11 and data type 3 in the low nibble of the access byte.
const _: () = assert!(FLAGS_CODE32 & 0xf == 0xb);
const _: () = assert!(FLAGS_DATA & 0xf == 0x3);

/// Decoded fields of a segment descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub base: u32,
    /// Effective byte limit, already scaled when G is set.
    pub limit: u32,
    pub type_: u8,
    pub s: u8,
    pub dpl: u8,
    pub present: u8,
    pub avl: u8,
    pub l: u8,
    pub db: u8,
    pub g: u8,
}

/// Pack `flags`, `base` and `limit` into a raw descriptor.
///
/// `flags[7:0]` is the access byte and `flags[15:12]` the G/DB/L/AVL
/// nibble; bits 11:8 are ignored.
pub fn encode(flags: u16, base: u32, limit: u32) -> u64 {
    debug_assert!(limit <= FLAT_LIMIT, "descriptor limit is 20 bits");

    let base = u64::from(base);
    let limit = u64::from(limit);
    let entry = ((base & 0xff00_0000) << 32)
        | ((u64::from(flags) & 0xf0ff) << 40)
        | ((limit & 0x000f_0000) << 32)
        | ((base & 0x00ff_ffff) << 16)
        | (limit & 0xffff);

    debug_assert!(decode(entry).base == base as u32);
    entry
}

/// Split a raw descriptor into its fields.
pub fn decode(entry: u64) -> Descriptor {
    let bit = |n: u32| ((entry >> n) & 1) as u8;

    let base = (((entry >> 32) & 0xff00_0000) | ((entry >> 16) & 0x00ff_ffff)) as u32;
    let raw_limit = (((entry >> 32) & 0x000f_0000) | (entry & 0xffff)) as u32;
    let g = bit(55);
    let limit = if g == 1 {
        (raw_limit << 12) | 0xfff
    } else {
        raw_limit
    };

    Descriptor {
        base,
        limit,
        type_: ((entry >> 40) & 0xf) as u8,
        s: bit(44),
        dpl: ((entry >> 45) & 0x3) as u8,
        present: bit(47),
        avl: bit(52),
        l: bit(53),
        db: bit(54),
        g,
    }
}
