// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The inverted index from physical pages to their references.
//!
//! Discovery walks every process's page tables and the kernel's, emitting a
//! reference for each terminal mapping. [`PageDb`] collects those references
//! keyed by physical page number, answering the question the overview layer
//! asks: *which processes reference this page?*
//!
//! The database has two lifecycle stages. During discovery it is
//! single-writer: the driver (or a per-worker shard, merged sequentially at
//! a phase boundary) inserts references in any order. [`PageDb::freeze`]
//! then derives each entry's flags (shared, kernel, zero) in a single
//! pass. After the freeze every query takes `&self` and is safe to call
//! from any thread.
//!
//! Lookups are `O(log n)` in the number of discovered pages. Iteration is
//! in ascending page-number order.

#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use memory::{PhysAddr, Protection, VirtAddr, PAGE_SIZE};
use pretty::{Bytes, Count};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt::Write as _;

/// The classification of a memory section.
///
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SectionKind {
    Code,
    Data,
    Heap,
    Stack,
    Library,
    Kernel,
    Anonymous,
    FileBacked,
}

impl SectionKind {
    /// Returns the kind's display name.
    ///
    pub const fn name(self) -> &'static str {
        match self {
            SectionKind::Code => "code",
            SectionKind::Data => "data",
            SectionKind::Heap => "heap",
            SectionKind::Stack => "stack",
            SectionKind::Library => "library",
            SectionKind::Kernel => "kernel",
            SectionKind::Anonymous => "anonymous",
            SectionKind::FileBacked => "file-backed",
        }
    }
}

/// What a reference records: a terminal page-table entry, or a
/// membership in a process memory section.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RefKind {
    Pte,
    Section,
}

/// One reference to a physical page.
///
#[derive(Clone, Debug)]
pub struct PageRef {
    /// The owning process, with 0 meaning the kernel.
    pub pid: u32,

    /// A snapshot of the process's command name at discovery
    /// time.
    pub comm: String,

    /// Whether this reference came from a page-table entry or a
    /// memory section.
    pub kind: RefKind,

    /// The virtual address at which the page is mapped.
    pub va: VirtAddr,

    /// The access permissions of the mapping.
    pub protection: Protection,

    /// The section classification, for section references.
    pub section: Option<SectionKind>,

    /// The size of the mapping or section, in bytes.
    pub size: u64,
}

/// A physical page and everything that references it.
///
#[derive(Clone, Debug)]
pub struct PageEntry {
    pfn: u64,
    refs: Vec<PageRef>,
    is_shared: bool,
    is_kernel: bool,
    is_zero: bool,
}

impl PageEntry {
    fn new(pfn: u64) -> Self {
        PageEntry {
            pfn,
            refs: Vec::new(),
            is_shared: false,
            is_kernel: false,
            is_zero: false,
        }
    }

    /// Returns the physical page number.
    ///
    #[inline]
    pub fn page_number(&self) -> u64 {
        self.pfn
    }

    /// Returns the physical address of the page's first byte.
    ///
    #[inline]
    pub fn phys_addr(&self) -> PhysAddr {
        PhysAddr::new(self.pfn << 12)
    }

    /// Returns the references to the page.
    ///
    #[inline]
    pub fn references(&self) -> &[PageRef] {
        &self.refs
    }

    /// Returns the set of distinct pids referencing the page.
    ///
    pub fn distinct_pids(&self) -> BTreeSet<u32> {
        self.refs.iter().map(|r| r.pid).collect()
    }

    /// Returns whether references from at least two distinct pids
    /// cover the page. Derived by [`PageDb::freeze`].
    ///
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.is_shared
    }

    /// Returns whether the kernel references the page: at least
    /// one reference has pid 0 or a kernel section kind. Derived
    /// by [`PageDb::freeze`].
    ///
    #[inline]
    pub fn is_kernel(&self) -> bool {
        self.is_kernel
    }

    /// Returns whether the page's contents were verified to be
    /// all zero. Derived by [`PageDb::freeze`].
    ///
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.is_zero
    }

    fn derive_flags(&mut self) {
        self.is_shared = self.distinct_pids().len() >= 2;
        self.is_kernel = self
            .refs
            .iter()
            .any(|r| r.pid == 0 || r.section == Some(SectionKind::Kernel));
    }
}

/// Summary statistics over the whole database.
///
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Statistics {
    pub total_pages: u64,
    pub total_references: u64,
    pub shared: u64,
    pub kernel: u64,
    pub zero: u64,
    pub unique_processes: u64,
}

/// The inverted index from physical page numbers to references.
///
#[derive(Debug, Default)]
pub struct PageDb {
    pages: BTreeMap<u64, PageEntry>,
    total_references: u64,
    frozen: bool,
}

impl PageDb {
    /// Creates an empty database.
    ///
    pub fn new() -> Self {
        PageDb::default()
    }

    /// Returns whether [`freeze`](PageDb::freeze) has run.
    ///
    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Records a reference to the page containing `pa`.
    ///
    /// Multiple references to one page accumulate. `O(log n)`.
    ///
    pub fn insert(&mut self, pa: PhysAddr, reference: PageRef) {
        debug_assert!(!self.frozen, "insert into a frozen PageDb");

        let pfn = pa.page_number();
        self.pages
            .entry(pfn)
            .or_insert_with(|| PageEntry::new(pfn))
            .refs
            .push(reference);
        self.total_references += 1;
    }

    /// Returns the entry for the page containing `pa`, if any.
    ///
    /// The address is masked to its 4 KiB page.
    ///
    pub fn get(&self, pa: PhysAddr) -> Option<&PageEntry> {
        self.pages.get(&pa.page_number())
    }

    /// Iterates over all entries in ascending page-number order.
    ///
    pub fn pages(&self) -> impl Iterator<Item = &PageEntry> {
        self.pages.values()
    }

    /// Iterates over entries referenced by at least two distinct
    /// pids.
    ///
    pub fn shared_pages(&self) -> impl Iterator<Item = &PageEntry> {
        self.pages.values().filter(|entry| entry.is_shared)
    }

    /// Iterates over entries the kernel references.
    ///
    pub fn kernel_pages(&self) -> impl Iterator<Item = &PageEntry> {
        self.pages.values().filter(|entry| entry.is_kernel)
    }

    /// Iterates over the physical addresses of pages referenced
    /// by `pid`.
    ///
    /// This scans the whole index: `O(total pages)`.
    ///
    pub fn process_pages(&self, pid: u32) -> impl Iterator<Item = PhysAddr> + '_ {
        self.pages
            .values()
            .filter(move |entry| entry.refs.iter().any(|r| r.pid == pid))
            .map(|entry| entry.phys_addr())
    }

    /// Absorbs another database's entries, appending its
    /// references.
    ///
    /// Used to merge per-worker shards sequentially at a phase
    /// boundary.
    ///
    pub fn merge(&mut self, other: PageDb) {
        debug_assert!(!self.frozen, "merge into a frozen PageDb");

        for (pfn, entry) in other.pages {
            self.pages
                .entry(pfn)
                .or_insert_with(|| PageEntry::new(pfn))
                .refs
                .extend(entry.refs);
        }
        self.total_references += other.total_references;
    }

    /// Derives every entry's flags and freezes the database.
    ///
    /// `is_zero` is consulted for every shared entry, and then for
    /// up to `zero_probe_limit` further entries in ascending
    /// page-number order; it should read the page's contents and
    /// report whether they are all zero.
    ///
    pub fn freeze<F>(&mut self, mut is_zero: F, zero_probe_limit: usize)
    where
        F: FnMut(PhysAddr) -> bool,
    {
        let mut probes_left = zero_probe_limit;
        for entry in self.pages.values_mut() {
            entry.derive_flags();

            if entry.is_shared {
                entry.is_zero = is_zero(entry.phys_addr());
            } else if probes_left > 0 {
                probes_left -= 1;
                entry.is_zero = is_zero(entry.phys_addr());
            }
        }

        self.frozen = true;
    }

    /// Computes summary statistics.
    ///
    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics {
            total_pages: self.pages.len() as u64,
            total_references: self.total_references,
            ..Statistics::default()
        };

        let mut pids = BTreeSet::new();
        for entry in self.pages.values() {
            if entry.is_shared {
                stats.shared += 1;
            }
            if entry.is_kernel {
                stats.kernel += 1;
            }
            if entry.is_zero {
                stats.zero += 1;
            }
            for reference in &entry.refs {
                if reference.pid != 0 {
                    pids.insert(reference.pid);
                }
            }
        }
        stats.unique_processes = pids.len() as u64;

        stats
    }

    /// Renders a short human-readable description of the page
    /// containing `pa`, for the overview tooltip.
    ///
    pub fn tooltip(&self, pa: PhysAddr) -> String {
        let entry = match self.get(pa) {
            Some(entry) => entry,
            None => return format!("page {:#x}: no known references", pa.align_down(PAGE_SIZE)),
        };

        let mut out = String::new();
        let _ = write!(
            out,
            "page {:#x}: {} reference{}",
            entry.phys_addr(),
            Count::new(entry.refs.len() as u64),
            if entry.refs.len() == 1 { "" } else { "s" },
        );
        if entry.is_shared {
            let _ = write!(out, ", shared by {} processes", entry.distinct_pids().len());
        }
        if entry.is_kernel {
            out.push_str(", kernel");
        }
        if entry.is_zero {
            out.push_str(", zero");
        }

        const SHOWN: usize = 8;
        for reference in entry.refs.iter().take(SHOWN) {
            let _ = write!(
                out,
                "\n  pid {} ({}) {} {}",
                reference.pid, reference.comm, reference.va, reference.protection,
            );
            match reference.section {
                Some(kind) => {
                    let _ = write!(out, " {} ({})", kind.name(), Bytes::new(reference.size));
                }
                None => {
                    let _ = write!(out, " ({})", Bytes::new(reference.size));
                }
            }
        }
        if entry.refs.len() > SHOWN {
            let _ = write!(out, "\n  … and {} more", entry.refs.len() - SHOWN);
        }

        out
    }
}
