// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Resolving each process's user-half translation root.
//!
//! An accepted `task_struct` carries a kernel pointer to its
//! `mm_struct`; the `mm_struct` carries a kernel pointer to the
//! process's PGD. Both pointers are virtual, so each hop is a
//! translation through the kernel PGD followed by a read. Under KPTI
//! the resulting user PGD carries only sparse user mappings plus a
//! tiny kernel trampoline, which is expected and fine.

use crate::profile::KernelProfile;
use guestram::GuestRam;
use memory::{PhysAddr, VirtAddr, PAGE_SIZE};
use pagewalk::Walker;

/// The resolved translation state of one process.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ResolvedTables {
    /// The physical address of the `mm_struct`.
    pub mm_pa: PhysAddr,

    /// The physical address of the user PGD.
    pub user_pgd: PhysAddr,
}

/// Resolves a task's `mm` pointer to its user PGD.
///
/// Returns `None` when any hop fails: the caller keeps the
/// process but marks its page tables unresolved.
///
pub(crate) fn resolve_user_pgd(
    walker: &Walker,
    ram: &GuestRam,
    profile: &KernelProfile,
    kernel_pgd: PhysAddr,
    mm: u64,
) -> Option<ResolvedTables> {
    let mm_va = VirtAddr::try_new(mm).ok()?;
    let mm_pa = walker.translate(mm_va, kernel_pgd).ok()?.pa;

    let space = walker.address_space();
    let pgd_field = space.pa_to_offset(mm_pa).ok()? + profile.mm.pgd as u64;
    let pgd_va = ram.read_u64_le(pgd_field).ok()?;

    let pgd_va = VirtAddr::try_new(pgd_va).ok()?;
    if !pgd_va.is_kernel() {
        return None;
    }

    let user_pgd = walker.translate(pgd_va, kernel_pgd).ok()?.pa;
    if !user_pgd.is_aligned(PAGE_SIZE) || !space.contains(user_pgd) {
        return None;
    }

    Some(ResolvedTables { mm_pa, user_pgd })
}
