// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The records discovery produces for each guest process.
//!
//! Kernel structures form cyclic pointer graphs (`task_struct` ↔
//! `mm_struct` ↔ memory sections), which these types flatten into an
//! arena of plain records addressed by guest physical address. Owning
//! data is stored by value in per-process vectors; relationships between
//! processes are expressed through the page database by physical address,
//! never by pointers.

use memory::{PageSize, PhysAddr, Protection, VirtAddr};
use pagedb::SectionKind;

/// One terminal page-table mapping, bound to its owning process.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PteRecord {
    /// The mapped virtual address.
    pub va: VirtAddr,

    /// The physical address it maps to.
    pub pa: PhysAddr,

    /// The mapping's access permissions.
    pub protection: Protection,

    /// The size of the mapping.
    pub size: PageSize,

    /// The owning pid, with 0 meaning the kernel.
    pub pid: u32,
}

/// One region of a process's virtual address space.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemorySection {
    /// The first address of the region.
    pub start: VirtAddr,

    /// The first address past the region.
    pub end: VirtAddr,

    /// The region's access permissions.
    pub protection: Protection,

    /// The region's classification.
    pub kind: SectionKind,

    /// An identifier for the backing file, where one is known.
    pub backing: Option<String>,
}

impl MemorySection {
    /// Returns whether the section covers `va`.
    ///
    pub fn contains(&self, va: VirtAddr) -> bool {
        self.start <= va && va < self.end
    }

    /// Returns the section's size in bytes.
    ///
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// One open file descriptor recovered from a process's file table.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OpenFile {
    /// The descriptor number.
    pub fd: u32,

    /// The backing inode's number.
    pub ino: u64,

    /// The backing inode's size in bytes.
    pub size: u64,

    /// The inode's mode bits.
    pub mode: u32,
}

/// Everything discovery learned about one guest process.
///
/// Immutable once the discovery pass that produced it returns.
///
#[derive(Clone, Debug)]
pub struct ProcessInfo {
    /// The process id. 0 is the idle task.
    pub pid: u32,

    /// The thread-group id.
    pub tgid: u32,

    /// The command name, at most 16 bytes in the guest.
    pub comm: String,

    /// Whether the task has no userspace: `mm` was NULL.
    pub is_kernel_thread: bool,

    /// The physical address of the task's `task_struct`.
    pub task_pa: PhysAddr,

    /// The physical address of the task's `mm_struct`, for tasks
    /// that have one.
    pub mm_pa: Option<PhysAddr>,

    /// The physical address of the task's user-half translation
    /// root. Under KPTI this carries only the sparse user
    /// mappings plus a small kernel trampoline.
    pub user_pgd: Option<PhysAddr>,

    /// Set when the task looked real but its translation root
    /// could not be resolved or validated; such a process
    /// contributes no mappings.
    pub pagetable_unresolved: bool,

    /// The process's memory sections, from the companion beacon
    /// where available, synthesised from mapping clusters
    /// otherwise.
    pub sections: Vec<MemorySection>,

    /// Every terminal mapping discovered for the process, in
    /// table order.
    pub ptes: Vec<PteRecord>,

    /// Open files recovered from the process's file table.
    pub open_files: Vec<OpenFile>,
}

impl ProcessInfo {
    /// Returns the section covering `va`, if any.
    ///
    pub fn section_at(&self, va: VirtAddr) -> Option<&MemorySection> {
        self.sections.iter().find(|section| section.contains(va))
    }
}
