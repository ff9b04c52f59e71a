// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::{PageSize, PhysAddr, Protection, VirtAddr};
use bitflags::bitflags;
use core::fmt;

// Bits 47..12 of a table or page descriptor hold the next-level
// or output address. Bits 11..0 and 63..48 hold attributes, and
// are masked off.
//
const ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;

/// One of the four ARM64 translation-table levels.
///
/// A translation walks the levels in order, consuming 9 bits of
/// the virtual address at each: the PGD at bits 47..39, the PUD
/// at 38..30, the PMD at 29..21, and the PTE at 20..12.
///
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Level {
    Pgd,
    Pud,
    Pmd,
    Pte,
}

impl Level {
    /// Returns the 9-bit table index the virtual address carries
    /// for this level.
    ///
    #[inline]
    pub const fn index(self, addr: VirtAddr) -> usize {
        ((addr.as_u64() >> self.shift()) & 0x1ff) as usize
    }

    /// Returns the bit position at which this level's index starts.
    ///
    #[inline]
    pub const fn shift(self) -> u64 {
        match self {
            Level::Pgd => 39,
            Level::Pud => 30,
            Level::Pmd => 21,
            Level::Pte => 12,
        }
    }

    /// Returns the next level down, or `None` at the final level.
    ///
    #[inline]
    pub const fn next(self) -> Option<Level> {
        match self {
            Level::Pgd => Some(Level::Pud),
            Level::Pud => Some(Level::Pmd),
            Level::Pmd => Some(Level::Pte),
            Level::Pte => None,
        }
    }

    /// Returns the size of the region a block descriptor maps at
    /// this level, or `None` where blocks are not permitted.
    ///
    #[inline]
    pub const fn block_size(self) -> Option<PageSize> {
        match self {
            Level::Pud => Some(PageSize::Size1GiB),
            Level::Pmd => Some(PageSize::Size2MiB),
            Level::Pgd | Level::Pte => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Level::Pgd => write!(f, "PGD"),
            Level::Pud => write!(f, "PUD"),
            Level::Pmd => write!(f, "PMD"),
            Level::Pte => write!(f, "PTE"),
        }
    }
}

bitflags! {
    /// The attribute bits of a translation-table descriptor.
    ///
    /// The write-permission convention follows the guest Linux
    /// kernel: writability is recorded in the `WRITE` (DBM) bit,
    /// while `READ_ONLY` (AP[2]) tracks hardware clean/dirty
    /// state and `EL0` (AP[1]) grants user access.
    ///
    pub struct DescriptorFlags: u64 {
        /// The descriptor maps something; bit 0.
        const VALID = 1 << 0;

        /// Set for table and page descriptors, clear for blocks;
        /// bit 1.
        const TYPE = 1 << 1;

        /// The mapping is non-secure; bit 5.
        const NON_SECURE = 1 << 5;

        /// The mapping is accessible from EL0 (user mode); AP[1].
        const EL0 = 1 << 6;

        /// The mapping is hardware read-only; AP[2].
        const READ_ONLY = 1 << 7;

        /// The access flag: set when the mapping has been used.
        const ACCESS = 1 << 10;

        /// The mapping is not global: it belongs to a single ASID.
        const NOT_GLOBAL = 1 << 11;

        /// The software/DBM writable bit the guest kernel uses to
        /// record write permission.
        const WRITE = 1 << 51;

        /// The mapping is part of a contiguous run.
        const CONTIGUOUS = 1 << 52;

        /// Privileged execute-never.
        const PXN = 1 << 53;

        /// Unprivileged execute-never.
        const UXN = 1 << 54;
    }
}

/// Classifies what a descriptor maps at a given level.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DescriptorKind {
    /// The descriptor maps nothing; the walk stops.
    Invalid,

    /// The descriptor points at the next-level table.
    Table,

    /// The descriptor terminates the walk at the PUD or PMD
    /// level, mapping a large region directly.
    Block(PageSize),

    /// The descriptor maps a 4 KiB page at the final level.
    Page,
}

/// A single 8-byte ARM64 translation-table descriptor.
///
/// A descriptor is meaningless without its level: the same low
/// two bits mean a block at the PUD or PMD level, a page at the
/// PTE level, and nothing at all elsewhere. [`kind`](Descriptor::kind)
/// performs that classification; the remaining accessors decode
/// the address and attribute fields.
///
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Descriptor(u64);

impl Descriptor {
    /// Wraps a raw descriptor value.
    ///
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Descriptor(raw)
    }

    /// Returns the raw descriptor value.
    ///
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns whether the valid bit is set.
    ///
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 & 1 == 1
    }

    /// Classifies the descriptor at the given level.
    ///
    /// The low two bits select the kind: `0b00` and `0b10` map
    /// nothing; `0b01` is a block at the PUD and PMD levels and
    /// invalid elsewhere; `0b11` is a table above the final level
    /// and a page at it.
    ///
    pub const fn kind(self, level: Level) -> DescriptorKind {
        if !self.is_valid() {
            return DescriptorKind::Invalid;
        }

        if self.0 & 0b10 != 0 {
            match level {
                Level::Pte => DescriptorKind::Page,
                _ => DescriptorKind::Table,
            }
        } else {
            match level.block_size() {
                Some(size) => DescriptorKind::Block(size),
                None => DescriptorKind::Invalid,
            }
        }
    }

    /// Returns the physical address in the descriptor: the
    /// next-level table for a table descriptor, or the output
    /// page for a page descriptor.
    ///
    #[inline]
    pub const fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    /// Returns the output address of a block descriptor at the
    /// given size, with the low bits of the block region masked
    /// off.
    ///
    #[inline]
    pub const fn block_address(self, size: PageSize) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK & !size.offset_mask())
    }

    /// Returns the descriptor's attribute bits.
    ///
    #[inline]
    pub const fn flags(self) -> DescriptorFlags {
        DescriptorFlags::from_bits_truncate(self.0)
    }

    /// Returns whether the access flag is set.
    ///
    #[inline]
    pub const fn is_accessed(self) -> bool {
        self.flags().contains(DescriptorFlags::ACCESS)
    }

    /// Decodes the descriptor's attribute bits into access
    /// permissions.
    ///
    /// Any valid terminal mapping is readable. Writability is the
    /// guest kernel's `WRITE`/DBM bit. Executability is the
    /// negation of UXN for user-accessible mappings and of PXN
    /// otherwise.
    ///
    pub const fn protection(self) -> Protection {
        let flags = self.flags();
        let mut prot = Protection::READ;

        if flags.contains(DescriptorFlags::WRITE) {
            prot = prot.union(Protection::WRITE);
        }

        let execute_never = if flags.contains(DescriptorFlags::EL0) {
            flags.contains(DescriptorFlags::UXN)
        } else {
            flags.contains(DescriptorFlags::PXN)
        };
        if !execute_never {
            prot = prot.union(Protection::EXECUTE);
        }

        prot
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Descriptor")
            .field(&format_args!("{:#x}", self.0))
            .finish()
    }
}
