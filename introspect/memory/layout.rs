// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::{PhysAddr, VirtAddr, PAGE_SIZE};
use core::fmt;

/// The guest physical address at which RAM typically starts on
/// the virt machine type: everything below is MMIO space and is
/// absent from the RAM file.
///
pub const DEFAULT_GUEST_RAM_BASE: u64 = 0x4000_0000;

/// The virtual base of the kernel's linear map of physical
/// memory for 48-bit kernels.
///
pub const DEFAULT_KERNEL_LINEAR_OFFSET: u64 = 0xffff_0000_0000_0000;

/// A physical address with no corresponding byte in the guest
/// RAM file.
///
/// Addresses below the guest RAM base are MMIO space, and
/// addresses past the end of RAM are nothing at all; neither is
/// backed by the file.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("guest physical address {0} is not backed by the RAM file")]
pub struct Unmapped(pub PhysAddr);

/// An invalid guest memory layout.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum LayoutError {
    #[error("guest RAM base {0:#x} is not aligned to the 4 KiB granule")]
    UnalignedBase(u64),
    #[error("guest RAM size {0:#x} is not aligned to the 4 KiB granule")]
    UnalignedSize(u64),
    #[error("kernel linear-map offset {0:#x} is not a kernel virtual address")]
    BadLinearOffset(u64),
}

/// Maps between the three address spaces the engine operates in:
/// file offsets, guest physical addresses, and kernel virtual
/// addresses.
///
/// Byte 0 of the guest RAM file corresponds to the guest physical
/// address `guest_ram_base` (typically 1 GiB on the virt machine
/// type); physical addresses below the base are MMIO space with
/// no backing bytes. The kernel maps all of physical memory
/// linearly at `kernel_linear_offset`, which gives a cheap
/// translation for the kernel pointers that point into the
/// linear map.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AddressSpace {
    guest_ram_base: PhysAddr,
    ram_size: u64,
    kernel_linear_offset: u64,
}

impl AddressSpace {
    /// Creates an address space description.
    ///
    /// `guest_ram_base` and `ram_size` must be aligned to the
    /// 4 KiB granule, and `kernel_linear_offset` must lie in the
    /// kernel half of the virtual address space.
    ///
    pub fn new(
        guest_ram_base: u64,
        ram_size: u64,
        kernel_linear_offset: u64,
    ) -> Result<Self, LayoutError> {
        if guest_ram_base % PAGE_SIZE != 0 {
            return Err(LayoutError::UnalignedBase(guest_ram_base));
        }
        if ram_size % PAGE_SIZE != 0 {
            return Err(LayoutError::UnalignedSize(ram_size));
        }
        if kernel_linear_offset >> 48 != 0xffff {
            return Err(LayoutError::BadLinearOffset(kernel_linear_offset));
        }

        Ok(AddressSpace {
            guest_ram_base: PhysAddr::new(guest_ram_base),
            ram_size,
            kernel_linear_offset,
        })
    }

    /// Returns the guest physical address of the first RAM byte.
    ///
    #[inline]
    pub const fn guest_ram_base(&self) -> PhysAddr {
        self.guest_ram_base
    }

    /// Returns the size of guest RAM in bytes.
    ///
    #[inline]
    pub const fn ram_size(&self) -> u64 {
        self.ram_size
    }

    /// Returns whether the physical address is backed by the RAM
    /// file.
    ///
    #[inline]
    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.guest_ram_base && (addr - self.guest_ram_base) < self.ram_size
    }

    /// Converts a guest physical address to its file offset.
    ///
    /// Addresses outside the RAM range are MMIO space or nothing
    /// at all and return [`Unmapped`].
    ///
    #[inline]
    pub fn pa_to_offset(&self, addr: PhysAddr) -> Result<u64, Unmapped> {
        if self.contains(addr) {
            Ok(addr - self.guest_ram_base)
        } else {
            Err(Unmapped(addr))
        }
    }

    /// Converts a file offset to its guest physical address.
    ///
    #[inline]
    pub fn offset_to_pa(&self, offset: u64) -> PhysAddr {
        self.guest_ram_base + offset
    }

    /// Returns whether the virtual address lies in the kernel
    /// half of the address space.
    ///
    #[inline]
    pub fn is_kernel_va(&self, addr: VirtAddr) -> bool {
        addr.is_kernel()
    }

    /// Translates a kernel linear-map virtual address directly to
    /// its physical address, without walking any tables.
    ///
    /// Returns `None` for addresses outside the linear map's
    /// image of guest RAM. This is a shortcut, not ground truth:
    /// callers that need certainty walk the kernel page tables
    /// instead.
    ///
    pub fn linear_to_pa(&self, addr: VirtAddr) -> Option<PhysAddr> {
        if !addr.is_kernel() {
            return None;
        }

        let linear = addr.as_u64().checked_sub(self.kernel_linear_offset)?;
        let pa = self.guest_ram_base.checked_add(linear)?;
        if self.contains(pa) {
            Some(pa)
        } else {
            None
        }
    }

    /// Returns the kernel linear-map virtual address of a guest
    /// physical address.
    ///
    pub fn pa_to_linear(&self, addr: PhysAddr) -> Option<VirtAddr> {
        if !self.contains(addr) {
            return None;
        }

        let linear = self.kernel_linear_offset + (addr - self.guest_ram_base);
        VirtAddr::try_new(linear).ok()
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "guest RAM {}..{} (linear map at {:#x})",
            self.guest_ram_base,
            self.guest_ram_base + self.ram_size,
            self.kernel_linear_offset,
        )
    }
}
