//! Per-mode guest memory and register setup.
//!
//! Two halves, so the migration sink can run only the second:
//!
//! - [`prepare_memory`] / [`write_tables`] write the image, the result-slot
//!   sentinel and the page tables into guest RAM.
//! - [`configure_registers`] fills `kvm_sregs` / `kvm_regs` for the mode.
//!
//! Neither half issues ioctls; the caller moves the register state in and
//! out of the vCPU.
//!
//! | Mode      | CR0                  | CR4 | EFER    | CR3    | CS           |
//! |-----------|----------------------|-----|---------|--------|--------------|
//! | Real      | (reset)              |     |         |        | sel 0, base 0|
//! | Protected | +PE                  |     |         |        | 32-bit flat  |
//! | Paged32   | PE MP ET NE WP AM PG | PSE | 0       | 0x2000 | 32-bit flat  |
//! | Long      | PE MP ET NE WP AM PG | PAE | LME LMA | 0x2000 | 64-bit flat  |

use kvm_bindings::{kvm_regs, kvm_segment, kvm_sregs};
use log::{debug, info};
use thiserror::Error;

use crate::config::PrivilegeMode;
use crate::memory::{
    GuestMemoryManager, MemoryError, LONG_MODE_STACK_TOP, PAGE_TABLE_ROOT, PDPT_START, PD_START,
};
use crate::verified::{paging, segment, transfer};

// ═══════════════════════════════════════════════════════════════════════
//  Control register bits
// ═══════════════════════════════════════════════════════════════════════

pub const X86_CR0_PE: u64 = 1 << 0;
pub const X86_CR0_MP: u64 = 1 << 1;
pub const X86_CR0_ET: u64 = 1 << 4;
pub const X86_CR0_NE: u64 = 1 << 5;
pub const X86_CR0_WP: u64 = 1 << 16;
pub const X86_CR0_AM: u64 = 1 << 18;
pub const X86_CR0_PG: u64 = 1 << 31;

pub const X86_CR4_PSE: u64 = 1 << 4;
pub const X86_CR4_PAE: u64 = 1 << 5;

pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;

/// CR0 for both paged modes.
pub const PAGED_CR0: u64 =
    X86_CR0_PE | X86_CR0_MP | X86_CR0_ET | X86_CR0_NE | X86_CR0_WP | X86_CR0_AM | X86_CR0_PG;

/// Bit 1 of RFLAGS is reserved and reads as one.
const RFLAGS_RESERVED: u64 = 0x2;

/// Code selector (GDT index 1).
pub const SELECTOR_CODE: u16 = 1 << 3;

/// Data selector (GDT index 2).
pub const SELECTOR_DATA: u16 = 2 << 3;

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("C-bit position {position} is outside {}..={}", paging::C_BIT_MIN, paging::C_BIT_MAX)]
    InvalidCBit { position: u32 },
}

/// Page tables written for a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableHierarchy {
    /// Real and protected mode run unpaged.
    Unpaged,
    Paged32 {
        directory: u64,
    },
    Long {
        pml4: u64,
        pdpt: u64,
        pd: u64,
        c_bit: Option<u32>,
    },
}

impl PageTableHierarchy {
    /// Value for CR3, if paging is on.
    pub fn root(&self) -> Option<u64> {
        match *self {
            PageTableHierarchy::Unpaged => None,
            PageTableHierarchy::Paged32 { directory } => Some(directory),
            PageTableHierarchy::Long { pml4, .. } => Some(pml4),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Memory
// ═══════════════════════════════════════════════════════════════════════

/// Load `image`, seed the result slot and write the mode's page tables.
pub fn prepare_memory(
    mem: &GuestMemoryManager,
    mode: PrivilegeMode,
    image: &[u8],
    c_bit: Option<u32>,
) -> Result<PageTableHierarchy, LayoutError> {
    mem.load_image(image)?;

    let width = mode.check_width();
    mem.write_data_slot(transfer::slot_sentinel(width), width)?;

    write_tables(mem, mode, c_bit)
}

/// Write the page tables for `mode`.
///
/// Exactly one entry per table is present; the rest of each table page
/// stays zero.  `c_bit` tags the long-mode leaf entry.  A 32-bit PSE entry
/// cannot hold it, so paged32 ignores it.
pub fn write_tables(
    mem: &GuestMemoryManager,
    mode: PrivilegeMode,
    c_bit: Option<u32>,
) -> Result<PageTableHierarchy, LayoutError> {
    if let Some(position) = c_bit {
        if !paging::c_bit_is_valid(position) {
            return Err(LayoutError::InvalidCBit { position });
        }
    }

    let tables = match mode {
        PrivilegeMode::Real | PrivilegeMode::Protected => PageTableHierarchy::Unpaged,
        PrivilegeMode::Paged32 => {
            if c_bit.is_some() {
                debug!("C-bit not representable in a 32-bit PDE, leaf left untagged");
            }
            mem.write_obj(paging::large_page_entry_32(0), PAGE_TABLE_ROOT)?;
            PageTableHierarchy::Paged32 {
                directory: PAGE_TABLE_ROOT,
            }
        }
        PrivilegeMode::Long => {
            mem.write_obj(paging::table_entry(PDPT_START), PAGE_TABLE_ROOT)?;
            mem.write_obj(paging::table_entry(PD_START), PDPT_START)?;
            mem.write_obj(paging::large_page_entry_64(0, c_bit), PD_START)?;
            PageTableHierarchy::Long {
                pml4: PAGE_TABLE_ROOT,
                pdpt: PDPT_START,
                pd: PD_START,
                c_bit,
            }
        }
    };

    if let Some(root) = tables.root() {
        info!("Page tables written for {mode} mode: root={root:#x}, c-bit={c_bit:?}");
    }
    Ok(tables)
}

// ═══════════════════════════════════════════════════════════════════════
//  Registers
// ═══════════════════════════════════════════════════════════════════════

/// Turn a raw descriptor into the segment register KVM loads.
pub fn kvm_segment_from_descriptor(entry: u64, selector: u16) -> kvm_segment {
    let d = segment::decode(entry);
    kvm_segment {
        base: u64::from(d.base),
        limit: d.limit,
        selector,
        type_: d.type_,
        present: d.present,
        dpl: d.dpl,
        db: d.db,
        s: d.s,
        l: d.l,
        g: d.g,
        avl: d.avl,
        unusable: u8::from(d.present == 0),
        padding: 0,
    }
}

pub fn code32_segment() -> kvm_segment {
    kvm_segment_from_descriptor(
        segment::encode(segment::FLAGS_CODE32, 0, segment::FLAT_LIMIT),
        SELECTOR_CODE,
    )
}

pub fn code64_segment() -> kvm_segment {
    kvm_segment_from_descriptor(
        segment::encode(segment::FLAGS_CODE64, 0, segment::FLAT_LIMIT),
        SELECTOR_CODE,
    )
}

pub fn data_segment() -> kvm_segment {
    kvm_segment_from_descriptor(
        segment::encode(segment::FLAGS_DATA, 0, segment::FLAT_LIMIT),
        SELECTOR_DATA,
    )
}

/// Long-mode data segment: the 64-bit code template retyped as
/// read/write data under the data selector.
pub fn data64_segment() -> kvm_segment {
    kvm_segment {
        type_: data_segment().type_,
        selector: SELECTOR_DATA,
        ..code64_segment()
    }
}

fn load_data_segments(sregs: &mut kvm_sregs, data: kvm_segment) {
    sregs.ds = data;
    sregs.es = data;
    sregs.fs = data;
    sregs.gs = data;
    sregs.ss = data;
}

/// Fill `sregs` and `regs` for `mode`.
///
/// `sregs` should hold the vCPU's reset state; real mode only rewrites
/// CS and keeps everything else.  `regs` is replaced outright.
pub fn configure_registers(mode: PrivilegeMode, sregs: &mut kvm_sregs, regs: &mut kvm_regs) {
    match mode {
        PrivilegeMode::Real => {
            sregs.cs.selector = 0;
            sregs.cs.base = 0;
        }
        PrivilegeMode::Protected => {
            sregs.cs = code32_segment();
            load_data_segments(sregs, data_segment());
            sregs.cr0 |= X86_CR0_PE;
        }
        PrivilegeMode::Paged32 => {
            sregs.cs = code32_segment();
            load_data_segments(sregs, data_segment());
            sregs.cr4 = X86_CR4_PSE;
            sregs.efer = 0;
        }
        PrivilegeMode::Long => {
            sregs.cs = code64_segment();
            load_data_segments(sregs, data64_segment());
            sregs.cr4 = X86_CR4_PAE;
            sregs.efer = EFER_LME | EFER_LMA;
        }
    }

    if mode.uses_paging() {
        sregs.cr3 = PAGE_TABLE_ROOT;
        sregs.cr0 = PAGED_CR0;
    }

    *regs = kvm_regs {
        rflags: RFLAGS_RESERVED,
        rip: crate::memory::GUEST_IMAGE_START,
        rsp: if mode == PrivilegeMode::Long {
            LONG_MODE_STACK_TOP
        } else {
            0
        },
        ..Default::default()
    };

    debug!(
        "{mode} registers: cr0={:#x} cr3={:#x} cr4={:#x} efer={:#x} cs.sel={:#x}",
        sregs.cr0, sregs.cr3, sregs.cr4, sregs.efer, sregs.cs.selector
    );
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
