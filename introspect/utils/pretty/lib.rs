// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides pretty printing for the quantities the engine reports.
//!
//! This crate provides helper types for pretty printing units in
//! statistics and tooltips: a number of bytes, using
//! [powers of 2 for larger units](https://en.wikipedia.org/wiki/Byte#Units_based_on_powers_of_2),
//! and a large count with thousands separators.
//!
//! # Examples
//!
//! ```
//! println!("{}", pretty::Bytes::new(4096)); // Prints "4 KiB"
//! println!("{}", pretty::Count::new(1234567)); // Prints "1,234,567"
//! ```

#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]

use core::fmt;

/// Contains a number of bytes.
///
pub struct Bytes(u64);

impl Bytes {
    /// Wraps a number of bytes.
    ///
    pub const fn new(n: u64) -> Self {
        Bytes(n)
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let units = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
        let mut b = self.0;
        for unit in units.iter() {
            if b >= 1024 {
                b >>= 10;
                continue;
            }

            return write!(f, "{b} {unit}");
        }

        write!(f, "{b} ZiB")
    }
}

/// Contains a count to be printed with thousands separators.
///
pub struct Count(u64);

impl Count {
    /// Wraps a count.
    ///
    pub const fn new(n: u64) -> Self {
        Count(n)
    }
}

impl fmt::Display for Count {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let digits = self.0.to_string();
        let mut out = String::with_capacity(digits.len() + digits.len() / 3);
        for (index, digit) in digits.chars().enumerate() {
            if index > 0 && (digits.len() - index) % 3 == 0 {
                out.push(',');
            }
            out.push(digit);
        }

        f.write_str(&out)
    }
}

#[cfg(test)]
mod test {
    use super::{Bytes, Count};

    #[test]
    fn test_bytes() {
        assert_eq!(format!("{}", Bytes::new(1)), "1 B");
        assert_eq!(format!("{}", Bytes::new(1023)), "1023 B");
        assert_eq!(format!("{}", Bytes::new(1024)), "1 KiB");
        assert_eq!(format!("{}", Bytes::new(4096)), "4 KiB");
        assert_eq!(format!("{}", Bytes::new(1000 * 1024)), "1000 KiB");
        assert_eq!(format!("{}", Bytes::new(2 * 1024 * 1024)), "2 MiB");
        assert_eq!(format!("{}", Bytes::new(16 * 1024 * 1024 * 1024)), "16 GiB");
    }

    #[test]
    fn test_count() {
        assert_eq!(format!("{}", Count::new(0)), "0");
        assert_eq!(format!("{}", Count::new(999)), "999");
        assert_eq!(format!("{}", Count::new(1000)), "1,000");
        assert_eq!(format!("{}", Count::new(1234567)), "1,234,567");
        assert_eq!(format!("{}", Count::new(10_000_000)), "10,000,000");
    }
}
