// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::align_down;
use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// A guest physical memory address.
///
/// A `PhysAddr` can only store an address that is valid for the
/// guest's physical address space: ARM64 with the 4 KiB granule
/// uses 48-bit physical addresses, so the top 16 bits are always
/// zero.
///
#[repr(transparent)]
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PhysAddr(u64);

/// An invalid guest physical memory address.
///
/// If an attempt is made to create a `PhysAddr` from a value with
/// any of the top 16 bits set, `InvalidPhysAddr` is returned,
/// containing the attempted value.
///
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, thiserror::Error)]
#[error("invalid guest physical address {0:#x}")]
pub struct InvalidPhysAddr(pub u64);

impl PhysAddr {
    /// Creates a new guest physical memory address.
    ///
    /// ## Panics
    ///
    /// `new` will panic if `addr` has any of the top 16 bits set.
    ///
    #[inline]
    #[track_caller]
    pub const fn new(addr: u64) -> Self {
        match Self::try_new(addr) {
            Ok(addr) => addr,
            Err(_) => panic!("invalid address passed to PhysAddr::new"),
        }
    }

    /// Tries to create a new guest physical memory address.
    ///
    /// If the passed value does not fit in the 48-bit physical
    /// address space, an error is returned.
    ///
    #[inline]
    pub const fn try_new(addr: u64) -> Result<Self, InvalidPhysAddr> {
        if addr >> 48 == 0 {
            Ok(PhysAddr(addr))
        } else {
            Err(InvalidPhysAddr(addr))
        }
    }

    /// Returns the address's numerical value.
    ///
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the zero physical memory address.
    ///
    #[inline]
    pub const fn zero() -> Self {
        PhysAddr(0)
    }

    /// Returns whether this is the zero address.
    ///
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Returns the physical page number: the address shifted down
    /// by the page size.
    ///
    #[inline]
    pub const fn page_number(self) -> u64 {
        self.0 >> 12
    }

    /// Aligns the physical address downwards to the largest exact
    /// multiple of `align` that is no larger than the address.
    ///
    /// `align` must be an exact power of two.
    ///
    #[inline]
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self {
        // A change of alignment cannot make a valid
        // address invalid, so we can skip the checks
        // in the constructor and return the result
        // directly.
        PhysAddr(align_down(self.0, align))
    }

    /// Checks whether the physical address has the given alignment.
    ///
    /// `align` must be an exact power of two.
    ///
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.align_down(align).0 == self.0
    }

    /// Checked integer addition. Computes `self + rhs`, returning
    /// `None` if overflow occurred or if the result is not a valid
    /// physical address.
    ///
    #[inline]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        if let Some(sum) = self.0.checked_add(rhs) {
            if let Ok(addr) = PhysAddr::try_new(sum) {
                Some(addr)
            } else {
                None
            }
        } else {
            None
        }
    }

    /// Checked integer subtraction. Computes `self - rhs`, returning
    /// `None` if the result would underflow.
    ///
    #[inline]
    pub const fn checked_sub(self, rhs: u64) -> Option<Self> {
        if let Some(diff) = self.0.checked_sub(rhs) {
            Some(PhysAddr(diff))
        } else {
            None
        }
    }
}

// Formatting.

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PhysAddr")
            .field(&format_args!("{:#x}", self.0))
            .finish()
    }
}

impl fmt::Display for PhysAddr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::UpperHex for PhysAddr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

// Mathematical operators.

impl Add<u64> for PhysAddr {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn add(self, rhs: u64) -> Self::Output {
        PhysAddr::new(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysAddr {
    #[inline]
    #[track_caller]
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl Sub<u64> for PhysAddr {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn sub(self, rhs: u64) -> Self::Output {
        PhysAddr::new(self.0 - rhs)
    }
}

impl SubAssign<u64> for PhysAddr {
    #[inline]
    #[track_caller]
    fn sub_assign(&mut self, rhs: u64) {
        self.0 -= rhs;
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = u64;

    #[inline]
    #[track_caller]
    fn sub(self, rhs: PhysAddr) -> Self::Output {
        self.0.checked_sub(rhs.0).expect("physical address underflow")
    }
}
