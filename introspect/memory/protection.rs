// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// The access permissions of a mapping.
    ///
    pub struct Protection: u8 {
        /// The mapping can be read.
        const READ = 1 << 0;

        /// The mapping can be written.
        const WRITE = 1 << 1;

        /// Instructions can be fetched from the mapping.
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    /// Returns whether the `READ` flag is set.
    ///
    #[inline]
    pub const fn readable(&self) -> bool {
        self.contains(Self::READ)
    }

    /// Returns whether the `WRITE` flag is set.
    ///
    #[inline]
    pub const fn writable(&self) -> bool {
        self.contains(Self::WRITE)
    }

    /// Returns whether the `EXECUTE` flag is set.
    ///
    #[inline]
    pub const fn executable(&self) -> bool {
        self.contains(Self::EXECUTE)
    }
}

impl fmt::Display for Protection {
    /// Formats the permissions in the style of `/proc/<pid>/maps`:
    /// `rwx`, with `-` for each missing permission.
    ///
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.readable() { 'r' } else { '-' },
            if self.writable() { 'w' } else { '-' },
            if self.executable() { 'x' } else { '-' },
        )
    }
}
