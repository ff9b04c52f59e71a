// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Contains types and functionality to represent guest memory addresses.
//!
//! This crate provides the core types for the three address spaces the
//! introspection engine operates in, plus the ARM64 translation-table
//! descriptor model that maps two of them together:
//!
//! - *File offsets* (`u64`): where bytes live in the guest RAM file.
//! - [`PhysAddr`]: an address in the guest's 48-bit physical address space.
//! - [`VirtAddr`]: a canonical address in the guest's 48-bit virtual address
//!   space, with the 4-level table indices derived from its bits.
//!
//! The [`AddressSpace`] type converts between the three: file offsets map to
//! guest-physical addresses by the guest RAM base, and kernel linear-map
//! virtual addresses map to guest-physical addresses by the linear offset.
//!
//! The [`Descriptor`] type parses a single 8-byte ARM64 translation-table
//! entry, classifying it per level as a table, block, or page descriptor
//! (see [`DescriptorKind`]) and decoding its attribute bits into a
//! [`Protection`]. Translations terminate at one of three [`PageSize`]s.
//!
//! The crate assumes the 4 KiB translation granule and 48-bit virtual
//! addresses throughout. Other granules are rejected where layouts are
//! validated.

#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

mod descriptor;
mod layout;
mod page_size;
mod phys_addr;
mod protection;
mod virt_addr;

pub use crate::descriptor::{Descriptor, DescriptorFlags, DescriptorKind, Level};
pub use crate::layout::{
    AddressSpace, LayoutError, Unmapped, DEFAULT_GUEST_RAM_BASE, DEFAULT_KERNEL_LINEAR_OFFSET,
};
pub use crate::page_size::PageSize;
pub use crate::phys_addr::{InvalidPhysAddr, PhysAddr};
pub use crate::protection::Protection;
pub use crate::virt_addr::{InvalidVirtAddr, TableIndices, VirtAddr};

/// The size of a translation granule, in bytes.
///
pub const PAGE_SIZE: u64 = 4096;

/// The number of 8-byte descriptors in one translation table.
///
pub const ENTRIES_PER_TABLE: usize = 512;

/// The size of a single translation-table descriptor, in bytes.
///
pub const DESCRIPTOR_SIZE: u64 = 8;

/// Aligns `value` to the largest exact multiple of two that is no
/// larger than `value`.
///
/// `align` must be an exact power of two.
///
#[inline]
pub const fn align_down(value: u64, align: u64) -> u64 {
    assert!(align.is_power_of_two(), "`align` must be a power of two");
    value & !(align - 1)
}

/// Aligns `value` to the smallest exact multiple of two that is no
/// smaller than `value`.
///
/// `align` must be an exact power of two.
///
#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    assert!(align.is_power_of_two(), "`align` must be a power of two");
    let mask = align - 1;
    if value & mask == 0 {
        value
    } else {
        (value | mask) + 1
    }
}
