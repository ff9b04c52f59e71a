// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! An on-demand window over the guest RAM file.
//!
//! The hypervisor exposes the virtual machine's physical memory as a file of
//! up to ~16 GiB. [`GuestRam`] supplies bounded reads over that file without
//! ever loading it whole: the file is mapped in 2 MiB windows, cached with
//! least-recently-used eviction under a configurable budget (256 MiB by
//! default).
//!
//! Reads are addressed by file offset. The conversion from guest physical
//! addresses to file offsets belongs to the `memory` crate's `AddressSpace`;
//! this crate knows nothing about the guest.
//!
//! ## Concurrency
//!
//! Any number of threads may read concurrently. A mutex protects only the
//! cache metadata; window contents are immutable for the window's lifetime
//! and are handed out as shared handles, so the bytes themselves are read
//! outside the lock.
//!
//! ## Failure semantics
//!
//! Reads past the end of the file return [`ReadError::OutOfRange`], which
//! callers treat as "not present". Lower-level I/O failures are fatal and
//! propagate as [`ReadError::Io`]. The file size is sampled once at open:
//! a file growing underneath the reader does not extend the readable range.

#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use byteorder::{ByteOrder, LittleEndian};
use lru::LruCache;
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// The size of one mapped window.
///
pub const WINDOW_SIZE: u64 = 2 * 1024 * 1024;

/// The default window-cache budget.
///
pub const DEFAULT_CACHE_BUDGET: u64 = 256 * 1024 * 1024;

/// A failed guest RAM read.
///
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The requested range extends past the end of the file.
    #[error("read of {len} bytes at offset {offset:#x} exceeds guest RAM size {total:#x}")]
    OutOfRange { offset: u64, len: u64, total: u64 },

    /// The underlying file read failed. This is fatal.
    #[error("guest RAM I/O failure")]
    Io(#[from] io::Error),
}

impl ReadError {
    /// Returns whether this is an out-of-range error, as opposed
    /// to a fatal I/O failure.
    ///
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, ReadError::OutOfRange { .. })
    }
}

/// One cached window of the guest RAM file.
///
/// A `Window` dereferences to the window's bytes, which start at
/// [`base_offset`](Window::base_offset) in the file. The final
/// window of the file may be shorter than [`WINDOW_SIZE`].
///
#[derive(Clone)]
pub struct Window {
    map: Arc<Mmap>,
    base: u64,
}

impl Window {
    /// Returns the file offset of the window's first byte.
    ///
    #[inline]
    pub fn base_offset(&self) -> u64 {
        self.base
    }
}

impl Deref for Window {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.map
    }
}

/// An on-demand, windowed view of the guest RAM file.
///
pub struct GuestRam {
    file: File,
    total_size: u64,
    cache: Mutex<LruCache<u64, Arc<Mmap>>>,
}

impl GuestRam {
    /// Opens the guest RAM file with the default cache budget.
    ///
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::open_with_budget(path, DEFAULT_CACHE_BUDGET)
    }

    /// Opens the guest RAM file, caching at most `cache_budget`
    /// bytes of mapped windows.
    ///
    /// Budgets below one window are rounded up to one window.
    ///
    pub fn open_with_budget<P: AsRef<Path>>(path: P, cache_budget: u64) -> io::Result<Self> {
        let file = File::open(path)?;
        let total_size = file.metadata()?.len();
        let windows = NonZeroUsize::new((cache_budget / WINDOW_SIZE) as usize)
            .unwrap_or(NonZeroUsize::MIN);

        Ok(GuestRam {
            file,
            total_size,
            cache: Mutex::new(LruCache::new(windows)),
        })
    }

    /// Returns the size of the guest RAM file, as sampled when it
    /// was opened.
    ///
    #[inline]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Returns the cached window containing `offset`, mapping it
    /// on a miss.
    ///
    /// The returned handle keeps the window's bytes alive even if
    /// the cache evicts it in the meantime.
    ///
    pub fn window_at(&self, offset: u64) -> Result<Window, ReadError> {
        if offset >= self.total_size {
            return Err(ReadError::OutOfRange {
                offset,
                len: 0,
                total: self.total_size,
            });
        }

        let base = offset & !(WINDOW_SIZE - 1);

        // A panicked reader cannot corrupt the cache: windows are
        // immutable once inserted, so a poisoned lock is usable.
        let mut cache = match self.cache.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(map) = cache.get(&base) {
            return Ok(Window {
                map: Arc::clone(map),
                base,
            });
        }

        // Miss: map the window, clipped to the end of the file,
        // and insert it. LruCache evicts the least-recently-used
        // window once the budget is reached.
        let len = (self.total_size - base).min(WINDOW_SIZE) as usize;
        let map = unsafe { MmapOptions::new().offset(base).len(len).map(&self.file)? };
        let map = Arc::new(map);
        cache.put(base, Arc::clone(&map));

        Ok(Window { map, base })
    }

    /// Reads `len` bytes at `offset`.
    ///
    /// Reads that cross a window boundary span the windows
    /// transparently and copy into the returned buffer.
    ///
    pub fn read_bytes(&self, offset: u64, len: u64) -> Result<Vec<u8>, ReadError> {
        let end = offset.checked_add(len).ok_or(ReadError::OutOfRange {
            offset,
            len,
            total: self.total_size,
        })?;
        if end > self.total_size {
            return Err(ReadError::OutOfRange {
                offset,
                len,
                total: self.total_size,
            });
        }

        let mut buf = Vec::with_capacity(len as usize);
        let mut offset = offset;
        while (buf.len() as u64) < len {
            let window = self.window_at(offset)?;
            let within = (offset - window.base_offset()) as usize;
            let want = (len as usize) - buf.len();
            let take = want.min(window.len() - within);
            buf.extend_from_slice(&window[within..within + take]);
            offset += take as u64;
        }

        Ok(buf)
    }

    /// Reads a little-endian `u32` at `offset`.
    ///
    pub fn read_u32_le(&self, offset: u64) -> Result<u32, ReadError> {
        let buf = self.read_scalar::<4>(offset)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    /// Reads a little-endian `u64` at `offset`.
    ///
    pub fn read_u64_le(&self, offset: u64) -> Result<u64, ReadError> {
        let buf = self.read_scalar::<8>(offset)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes at
    /// `offset`.
    ///
    /// The read stops at the first NUL, at `max_len`, or at the end
    /// of the file, whichever comes first; bytes that are not valid
    /// UTF-8 are replaced. Content never makes this fail: only an
    /// offset at or past the end of the file does.
    ///
    pub fn read_cstring(&self, offset: u64, max_len: u64) -> Result<String, ReadError> {
        if offset >= self.total_size {
            return Err(ReadError::OutOfRange {
                offset,
                len: max_len,
                total: self.total_size,
            });
        }

        let len = max_len.min(self.total_size - offset);
        let buf = self.read_bytes(offset, len)?;
        let bytes = match buf.iter().position(|&b| b == 0) {
            Some(nul) => &buf[..nul],
            None => &buf[..],
        };

        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Reads a small fixed-size scalar, avoiding the heap for the
    /// common case of a read within one window.
    ///
    fn read_scalar<const N: usize>(&self, offset: u64) -> Result<[u8; N], ReadError> {
        let end = offset.checked_add(N as u64).ok_or(ReadError::OutOfRange {
            offset,
            len: N as u64,
            total: self.total_size,
        })?;
        if end > self.total_size {
            return Err(ReadError::OutOfRange {
                offset,
                len: N as u64,
                total: self.total_size,
            });
        }

        let window = self.window_at(offset)?;
        let within = (offset - window.base_offset()) as usize;
        let mut buf = [0_u8; N];
        if within + N <= window.len() {
            buf.copy_from_slice(&window[within..within + N]);
        } else {
            // The scalar straddles a window boundary.
            let bytes = self.read_bytes(offset, N as u64)?;
            buf.copy_from_slice(&bytes);
        }

        Ok(buf)
    }
}
