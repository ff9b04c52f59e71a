// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Translates guest virtual addresses to guest physical addresses.
//!
//! The [`Walker`] performs ARM64 4-level translations (PGD → PUD → PMD →
//! PTE, 9+9+9+9+12 bits, 4 KiB granule, 48-bit virtual addresses) over the
//! guest RAM file, using a caller-supplied PGD physical address as the
//! translation root. Block descriptors terminate a walk early at the PUD
//! (1 GiB) or PMD (2 MiB) level.
//!
//! Two operations are provided:
//!
//! - [`Walker::translate`] resolves a single virtual address, producing a
//!   [`Translation`] with the output address, permissions, and mapping size.
//! - [`Walker::walk`] enumerates every terminal mapping reachable from a
//!   PGD, in (PGD, PUD, PMD, PTE) lexicographic order, driving a visitor
//!   callback. Invalid and dangling descriptors are skipped and counted,
//!   never surfaced as errors.
//!
//! The walker is purely functional: it holds no state beyond its guest RAM
//! handle and the address-space description, and translations never write.
//! All recoverable conditions are reported as [`Fault`] values; only an I/O
//! failure of the underlying file is fatal.

#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use guestram::{GuestRam, ReadError};
use memory::{
    AddressSpace, Descriptor, DescriptorKind, Level, PageSize, PhysAddr, Protection, VirtAddr,
    DESCRIPTOR_SIZE, ENTRIES_PER_TABLE, PAGE_SIZE,
};
use std::sync::Arc;

/// The result of translating one virtual address.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Translation {
    /// The guest physical address the virtual address maps to.
    pub pa: PhysAddr,

    /// The access permissions of the mapping.
    pub protection: Protection,

    /// The size of the region the terminal descriptor maps.
    pub size: PageSize,

    /// The level at which the translation terminated.
    pub level: Level,

    /// Whether the access flag was set on the terminal descriptor.
    pub accessed: bool,
}

/// A failed translation.
///
/// `Invalid` and `Dangling` are ordinary outcomes (most virtual
/// addresses are unmapped) and callers treat them as "not
/// present". `Io` is a fatal failure of the guest RAM file.
///
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    /// The walk reached a descriptor that maps nothing, either
    /// because its valid bits are clear or because its next-level
    /// table lies outside guest RAM.
    #[error("invalid descriptor at {level} level")]
    Invalid { level: Level },

    /// The walk terminated, but the output address lies outside
    /// guest RAM.
    #[error("translation at {level} level yields {pa} outside guest RAM")]
    Dangling { level: Level, pa: PhysAddr },

    /// The guest RAM file failed beneath the walk. Fatal.
    #[error("guest RAM failure during translation")]
    Io(#[source] ReadError),
}

impl Fault {
    /// Returns whether the fault is a recoverable "not mapped"
    /// outcome rather than a fatal I/O failure.
    ///
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Fault::Io(_))
    }
}

/// Tells [`Walker::walk`] whether to continue the enumeration.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalkControl {
    Continue,
    Stop,
}

/// Which half of the virtual address space a translation root
/// covers.
///
/// The PGD being walked carries no trace of this itself: a user
/// root (`TTBR0`) maps addresses with the top 16 bits clear, the
/// kernel root (`TTBR1`) maps addresses with them set, and the
/// enumerated virtual addresses are rebuilt accordingly.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VaRange {
    User,
    Kernel,
}

impl VaRange {
    const fn base(self) -> u64 {
        match self {
            VaRange::User => 0,
            VaRange::Kernel => 0xffff_0000_0000_0000,
        }
    }
}

/// Counters describing one full-table enumeration.
///
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WalkStats {
    /// Terminal mappings passed to the visitor.
    pub terminal: u64,

    /// Populated descriptors whose valid bits were clear.
    pub invalid: u64,

    /// Descriptors pointing outside guest RAM, at any level.
    pub dangling: u64,

    /// Whether the visitor stopped the walk early.
    pub stopped: bool,
}

/// An ARM64 4-level page-table walker over the guest RAM file.
///
pub struct Walker {
    ram: Arc<GuestRam>,
    space: AddressSpace,
}

impl Walker {
    /// Creates a walker reading translation tables from `ram`,
    /// with physical addresses interpreted by `space`.
    ///
    pub fn new(ram: Arc<GuestRam>, space: AddressSpace) -> Self {
        Walker { ram, space }
    }

    /// Returns the address-space description the walker uses.
    ///
    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    /// Translates a virtual address using the translation tables
    /// rooted at `pgd`.
    ///
    pub fn translate(&self, va: VirtAddr, pgd: PhysAddr) -> Result<Translation, Fault> {
        let mut table = pgd;
        let mut level = Level::Pgd;

        // Four iterations at most: the PTE level never yields
        // another table, so `level.next()` is always populated
        // when we recurse.
        loop {
            let desc = self.descriptor_at(table, level.index(va), level)?;

            match desc.kind(level) {
                DescriptorKind::Invalid => return Err(Fault::Invalid { level }),

                DescriptorKind::Block(size) => {
                    let pa = self.terminal_address(
                        desc.block_address(size),
                        va.as_u64() & size.offset_mask(),
                        level,
                    )?;
                    return Ok(Translation {
                        pa,
                        protection: desc.protection(),
                        size,
                        level,
                        accessed: desc.is_accessed(),
                    });
                }

                DescriptorKind::Page => {
                    let pa = self.terminal_address(
                        desc.address(),
                        va.as_u64() & PageSize::Size4KiB.offset_mask(),
                        level,
                    )?;
                    return Ok(Translation {
                        pa,
                        protection: desc.protection(),
                        size: PageSize::Size4KiB,
                        level,
                        accessed: desc.is_accessed(),
                    });
                }

                DescriptorKind::Table => {
                    let next = desc.address();
                    if !self.space.contains(next) {
                        // A table pointer leading outside guest RAM
                        // cannot be followed; the descriptor is as
                        // good as invalid.
                        return Err(Fault::Invalid { level });
                    }
                    table = next;
                    level = match level.next() {
                        Some(next) => next,
                        None => unreachable!("page descriptor classified as table"),
                    };
                }
            }
        }
    }

    /// Enumerates every terminal mapping reachable from `pgd`, in
    /// (PGD, PUD, PMD, PTE) lexicographic order, passing each to
    /// `visit` together with its virtual address in the given
    /// half.
    ///
    /// All 512 entries are visited at every level. Invalid and
    /// dangling descriptors are skipped and counted in the
    /// returned [`WalkStats`]; only guest RAM I/O failures abort
    /// the walk.
    ///
    pub fn walk<F>(&self, pgd: PhysAddr, range: VaRange, visit: &mut F) -> Result<WalkStats, Fault>
    where
        F: FnMut(VirtAddr, &Translation) -> WalkControl,
    {
        let mut stats = WalkStats::default();
        self.walk_table(pgd, Level::Pgd, range.base(), visit, &mut stats)?;
        Ok(stats)
    }

    /// Reads a whole translation table as its 512 descriptors.
    ///
    /// Returns `None` if the table page is not backed by the RAM
    /// file.
    ///
    pub fn read_table(&self, table: PhysAddr) -> Result<Option<Vec<Descriptor>>, Fault> {
        let offset = match self.space.pa_to_offset(table) {
            Ok(offset) => offset,
            Err(_) => return Ok(None),
        };

        let bytes = match self.ram.read_bytes(offset, PAGE_SIZE) {
            Ok(bytes) => bytes,
            Err(err) if err.is_out_of_range() => return Ok(None),
            Err(err) => return Err(Fault::Io(err)),
        };

        let descriptors = bytes
            .chunks_exact(DESCRIPTOR_SIZE as usize)
            .map(|chunk| {
                let mut raw = [0_u8; 8];
                raw.copy_from_slice(chunk);
                Descriptor::new(u64::from_le_bytes(raw))
            })
            .collect();

        Ok(Some(descriptors))
    }

    /// Recursively enumerates one table.
    ///
    fn walk_table<F>(
        &self,
        table: PhysAddr,
        level: Level,
        va_base: u64,
        visit: &mut F,
        stats: &mut WalkStats,
    ) -> Result<WalkControl, Fault>
    where
        F: FnMut(VirtAddr, &Translation) -> WalkControl,
    {
        let descriptors = match self.read_table(table)? {
            Some(descriptors) => descriptors,
            None => {
                stats.dangling += 1;
                return Ok(WalkControl::Continue);
            }
        };

        for (index, desc) in descriptors.iter().enumerate() {
            let va = VirtAddr::new(va_base | ((index as u64) << level.shift()));

            match desc.kind(level) {
                DescriptorKind::Invalid => {
                    // Empty slots are simply absent; populated
                    // descriptors with clear valid bits are counted.
                    if desc.raw() != 0 {
                        stats.invalid += 1;
                    }
                }

                DescriptorKind::Block(size) => {
                    let pa = desc.block_address(size);
                    if !self.space.contains(pa) {
                        stats.dangling += 1;
                        continue;
                    }
                    stats.terminal += 1;
                    let translation = Translation {
                        pa,
                        protection: desc.protection(),
                        size,
                        level,
                        accessed: desc.is_accessed(),
                    };
                    if visit(va, &translation) == WalkControl::Stop {
                        stats.stopped = true;
                        return Ok(WalkControl::Stop);
                    }
                }

                DescriptorKind::Page => {
                    let pa = desc.address();
                    if !self.space.contains(pa) {
                        stats.dangling += 1;
                        continue;
                    }
                    stats.terminal += 1;
                    let translation = Translation {
                        pa,
                        protection: desc.protection(),
                        size: PageSize::Size4KiB,
                        level,
                        accessed: desc.is_accessed(),
                    };
                    if visit(va, &translation) == WalkControl::Stop {
                        stats.stopped = true;
                        return Ok(WalkControl::Stop);
                    }
                }

                DescriptorKind::Table => {
                    let next = desc.address();
                    if !self.space.contains(next) {
                        stats.dangling += 1;
                        continue;
                    }
                    let next_level = match level.next() {
                        Some(next_level) => next_level,
                        None => unreachable!("page descriptor classified as table"),
                    };
                    let child_base = va_base | ((index as u64) << level.shift());
                    if self.walk_table(next, next_level, child_base, visit, stats)?
                        == WalkControl::Stop
                    {
                        return Ok(WalkControl::Stop);
                    }
                }
            }
        }

        Ok(WalkControl::Continue)
    }

    /// Builds and validates a terminal output address.
    ///
    fn terminal_address(
        &self,
        base: PhysAddr,
        offset: u64,
        level: Level,
    ) -> Result<PhysAddr, Fault> {
        let pa = base
            .checked_add(offset)
            .ok_or(Fault::Dangling { level, pa: base })?;
        if self.space.contains(pa) {
            Ok(pa)
        } else {
            Err(Fault::Dangling { level, pa })
        }
    }

    /// Reads the descriptor at `table[index]`.
    ///
    fn descriptor_at(
        &self,
        table: PhysAddr,
        index: usize,
        level: Level,
    ) -> Result<Descriptor, Fault> {
        debug_assert!(index < ENTRIES_PER_TABLE);

        let offset = self
            .space
            .pa_to_offset(table)
            .map_err(|_| Fault::Invalid { level })?
            + (index as u64) * DESCRIPTOR_SIZE;

        match self.ram.read_u64_le(offset) {
            Ok(raw) => Ok(Descriptor::new(raw)),
            Err(err) if err.is_out_of_range() => Err(Fault::Invalid { level }),
            Err(err) => Err(Fault::Io(err)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Fault, Translation, VaRange, WalkControl, Walker};
    use guestram::GuestRam;
    use memory::{AddressSpace, Level, PageSize, PhysAddr, Protection, VirtAddr};
    use std::io::{Seek, SeekFrom, Write};
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    /// A sparse synthetic guest RAM image under construction.
    ///
    struct Image {
        file: NamedTempFile,
        base: u64,
    }

    impl Image {
        fn new(base: u64, size: u64) -> Self {
            let file = NamedTempFile::new().unwrap();
            file.as_file().set_len(size).unwrap();
            Image { file, base }
        }

        /// Writes a descriptor into the table at physical
        /// address `table`, slot `index`.
        ///
        fn descriptor(&mut self, table: u64, index: u64, value: u64) {
            let offset = (table - self.base) + index * 8;
            self.file
                .as_file_mut()
                .seek(SeekFrom::Start(offset))
                .unwrap();
            self.file
                .as_file_mut()
                .write_all(&value.to_le_bytes())
                .unwrap();
        }

        fn walker(&mut self) -> Walker {
            self.file.as_file_mut().flush().unwrap();
            let size = self.file.as_file().metadata().unwrap().len();
            let ram = Arc::new(GuestRam::open(self.file.path()).unwrap());
            let space = AddressSpace::new(self.base, size, 0xffff_0000_0000_0000).unwrap();
            Walker::new(ram, space)
        }
    }

    #[test]
    fn test_translate_4kib_page() {
        // PGD[0] -> PUD[0] -> PMD[0] -> PTE[0] -> page 0x204000.
        let mut image = Image::new(0, 16 * 1024 * 1024);
        image.descriptor(0x0020_0000, 0, 0x0020_1003);
        image.descriptor(0x0020_1000, 0, 0x0020_2003);
        image.descriptor(0x0020_2000, 0, 0x0020_3003);
        image.descriptor(0x0020_3000, 0, 0x0020_4043);
        let walker = image.walker();

        let translation = walker
            .translate(VirtAddr::zero(), PhysAddr::new(0x0020_0000))
            .unwrap();
        assert_eq!(
            translation,
            Translation {
                pa: PhysAddr::new(0x0020_4000),
                protection: Protection::READ | Protection::EXECUTE,
                size: PageSize::Size4KiB,
                level: Level::Pte,
                accessed: false,
            }
        );

        // The page offset carries through.
        let translation = walker
            .translate(VirtAddr::new(0x567), PhysAddr::new(0x0020_0000))
            .unwrap();
        assert_eq!(translation.pa, PhysAddr::new(0x0020_4567));
    }

    #[test]
    fn test_translate_1gib_block() {
        // PGD[0] -> PUD; PUD[1] maps a 1 GiB block at 0x4000_0000.
        let mut image = Image::new(0, 0x8000_0000 + 0x10_0000);
        image.descriptor(0x0020_0000, 0, 0x0020_1003);
        image.descriptor(0x0020_1000, 1, 0x4000_0001);
        let walker = image.walker();

        let translation = walker
            .translate(
                VirtAddr::new(0x4000_0000 + 0x12345),
                PhysAddr::new(0x0020_0000),
            )
            .unwrap();
        assert_eq!(translation.pa, PhysAddr::new(0x4000_0000 + 0x12345));
        assert_eq!(translation.size, PageSize::Size1GiB);
        assert_eq!(translation.level, Level::Pud);
    }

    #[test]
    fn test_translate_2mib_block() {
        // PGD[0] -> PUD[0] -> PMD[3] maps a 2 MiB block; virtual
        // address bits 20..0 form the offset into the region.
        let mut image = Image::new(0, 16 * 1024 * 1024);
        image.descriptor(0x0020_0000, 0, 0x0020_1003);
        image.descriptor(0x0020_1000, 0, 0x0020_2003);
        image.descriptor(0x0020_2000, 3, 0x0060_0001);
        let walker = image.walker();

        let va = VirtAddr::new((3 << 21) | 0x1_2345);
        let translation = walker.translate(va, PhysAddr::new(0x0020_0000)).unwrap();
        assert_eq!(translation.pa, PhysAddr::new(0x0060_0000 + 0x1_2345));
        assert_eq!(translation.size, PageSize::Size2MiB);
        assert_eq!(translation.level, Level::Pmd);
    }

    #[test]
    fn test_translate_kernel_va() {
        // A kernel address of the form 0xffff_0000_8000_0000 walks
        // PGD[0], PUD[2], PMD[0], PTE[0] and lands in guest RAM.
        let base = 0x4000_0000;
        let pgd = 0x0_82c0_0000_u64;
        let mut image = Image::new(base, 0x8000_0000);

        // Child tables directly after the PGD page.
        image.descriptor(pgd, 0, (pgd + 0x1000) | 3);
        image.descriptor(pgd + 0x1000, 2, (pgd + 0x2000) | 3);
        image.descriptor(pgd + 0x2000, 0, (pgd + 0x3000) | 3);
        image.descriptor(pgd + 0x3000, 0, 0x4000_5000 | 0x403);
        let walker = image.walker();

        let translation = walker
            .translate(
                VirtAddr::new(0xffff_0000_8000_0000),
                PhysAddr::new(pgd),
            )
            .unwrap();
        assert_eq!(translation.pa, PhysAddr::new(0x4000_5000));
        assert!(translation.accessed);

        // Enumerating the same root as a kernel table rebuilds
        // the kernel-half virtual address.
        let mut seen = Vec::new();
        walker
            .walk(
                PhysAddr::new(pgd),
                VaRange::Kernel,
                &mut |va, translation| {
                    seen.push((va.as_u64(), translation.pa.as_u64()));
                    WalkControl::Continue
                },
            )
            .unwrap();
        assert_eq!(seen, vec![(0xffff_0000_8000_0000, 0x4000_5000)]);
    }

    #[test]
    fn test_translate_faults() {
        let mut image = Image::new(0, 16 * 1024 * 1024);
        image.descriptor(0x0020_0000, 0, 0x0020_1003);
        // PUD[0] empty; PUD[1] valid bits clear but populated;
        // PUD[2] a table pointing outside guest RAM; PUD[3] a
        // block whose output lands outside guest RAM.
        image.descriptor(0x0020_1000, 1, 0x0030_0002);
        image.descriptor(0x0020_1000, 2, 0x00f0_0000_0003);
        image.descriptor(0x0020_1000, 3, 0x00f0_4000_0001);
        let walker = image.walker();
        let pgd = PhysAddr::new(0x0020_0000);

        // An empty descriptor is invalid at the level it was read.
        match walker.translate(VirtAddr::zero(), pgd) {
            Err(Fault::Invalid { level: Level::Pud }) => {}
            other => panic!("unexpected result: {:?}", other.map(|t| t.pa)),
        }

        // So is a populated descriptor with clear valid bits.
        match walker.translate(VirtAddr::new(1 << 30), pgd) {
            Err(Fault::Invalid { level: Level::Pud }) => {}
            other => panic!("unexpected result: {:?}", other.map(|t| t.pa)),
        }

        // A table descriptor pointing outside guest RAM cannot be
        // followed.
        match walker.translate(VirtAddr::new(2 << 30), pgd) {
            Err(Fault::Invalid { level: Level::Pud }) => {}
            other => panic!("unexpected result: {:?}", other.map(|t| t.pa)),
        }

        // A block landing outside guest RAM is dangling.
        match walker.translate(VirtAddr::new(3 << 30), pgd) {
            Err(Fault::Dangling {
                level: Level::Pud, ..
            }) => {}
            other => panic!("unexpected result: {:?}", other.map(|t| t.pa)),
        }
    }

    #[test]
    fn test_walk_order_and_counts() {
        // Two 4 KiB pages and one 2 MiB block, plus one invalid
        // and one dangling descriptor to count.
        let mut image = Image::new(0, 16 * 1024 * 1024);
        image.descriptor(0x0020_0000, 0, 0x0020_1003);
        image.descriptor(0x0020_1000, 0, 0x0020_2003);
        image.descriptor(0x0020_2000, 0, 0x0020_3003);
        image.descriptor(0x0020_2000, 1, 0x0040_0001); // 2 MiB block
        image.descriptor(0x0020_2000, 2, 0x0050_0002); // invalid
        image.descriptor(0x0020_3000, 1, 0x0020_4003);
        image.descriptor(0x0020_3000, 4, 0x0020_5003);
        image.descriptor(0x0020_3000, 5, 0x00f0_0020_6003); // dangling
        let walker = image.walker();

        let mut seen = Vec::new();
        let stats = walker
            .walk(
                PhysAddr::new(0x0020_0000),
                VaRange::User,
                &mut |va, translation| {
                    seen.push((va.as_u64(), translation.pa.as_u64()));
                    WalkControl::Continue
                },
            )
            .unwrap();

        // Lexicographic (PGD, PUD, PMD, PTE) order.
        assert_eq!(
            seen,
            vec![
                (0x1000, 0x0020_4000),
                (0x4000, 0x0020_5000),
                (0x20_0000, 0x0040_0000),
            ]
        );
        assert_eq!(stats.terminal, 3);
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.dangling, 1);
        assert!(!stats.stopped);
    }

    #[test]
    fn test_walk_stop() {
        let mut image = Image::new(0, 16 * 1024 * 1024);
        image.descriptor(0x0020_0000, 0, 0x0020_1003);
        image.descriptor(0x0020_1000, 0, 0x0020_2003);
        image.descriptor(0x0020_2000, 0, 0x0020_3003);
        for index in 0..8 {
            image.descriptor(0x0020_3000, index, (0x0030_0000 + index * 0x1000) | 3);
        }
        let walker = image.walker();

        let mut seen = 0;
        let stats = walker
            .walk(PhysAddr::new(0x0020_0000), VaRange::User, &mut |_, _| {
                seen += 1;
                if seen == 3 {
                    WalkControl::Stop
                } else {
                    WalkControl::Continue
                }
            })
            .unwrap();

        assert_eq!(seen, 3);
        assert_eq!(stats.terminal, 3);
        assert!(stats.stopped);
    }
}
