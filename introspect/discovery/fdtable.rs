// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Recovering a process's open files from its file table.
//!
//! The chain is `task_struct.files → files_struct.fdt →
//! fdtable.fd[0..max_fds]`, every hop a kernel pointer. Each populated
//! descriptor leads through `struct file` to an inode, from which the
//! inode number, size, and mode are read. The results label what a
//! process has open; they are supplementary and a failure anywhere
//! along the chain silently abandons the walk for that process.

use crate::process::OpenFile;
use crate::profile::KernelProfile;
use guestram::GuestRam;
use memory::{PhysAddr, VirtAddr};
use pagewalk::Walker;

/// Walks a task's file table, returning up to `max_files` open
/// descriptors.
///
/// Returns `None` when the chain to the descriptor array cannot
/// be followed; individual unreadable descriptors are skipped.
///
pub(crate) fn walk_open_files(
    walker: &Walker,
    ram: &GuestRam,
    profile: &KernelProfile,
    kernel_pgd: PhysAddr,
    task_offset: u64,
    max_files: u32,
) -> Option<Vec<OpenFile>> {
    let space = walker.address_space();

    let read_kernel_ptr = |va: u64, field: u32| -> Option<u64> {
        let va = VirtAddr::try_new(va).ok()?;
        let pa = walker.translate(va, kernel_pgd).ok()?.pa;
        let offset = space.pa_to_offset(pa).ok()? + field as u64;
        ram.read_u64_le(offset).ok()
    };

    let files = ram
        .read_u64_le(task_offset + profile.task.files as u64)
        .ok()?;
    if files == 0 {
        // Kernel threads have no file table; nothing to report.
        return Some(Vec::new());
    }

    let fdt = read_kernel_ptr(files, profile.files.fdt)?;

    let fdt_va = VirtAddr::try_new(fdt).ok()?;
    let fdt_pa = walker.translate(fdt_va, kernel_pgd).ok()?.pa;
    let fdt_offset = space.pa_to_offset(fdt_pa).ok()?;
    let max_fds = ram
        .read_u32_le(fdt_offset + profile.fdt.max_fds as u64)
        .ok()?;
    let fd_array = ram.read_u64_le(fdt_offset + profile.fdt.fd as u64).ok()?;
    if fd_array >> 48 != 0xffff {
        return None;
    }

    let count = max_fds.min(max_files);
    let mut open = Vec::new();

    for fd in 0..count {
        // The array may cross page boundaries; translate each
        // slot's own address.
        let slot = match VirtAddr::try_new(fd_array + fd as u64 * 8) {
            Ok(slot) => slot,
            Err(_) => break,
        };
        let slot_pa = match walker.translate(slot, kernel_pgd) {
            Ok(translation) => translation.pa,
            Err(_) => continue,
        };
        let slot_offset = match space.pa_to_offset(slot_pa) {
            Ok(offset) => offset,
            Err(_) => continue,
        };
        let file = match ram.read_u64_le(slot_offset) {
            Ok(file) => file,
            Err(_) => continue,
        };
        if file == 0 {
            continue;
        }

        let inode = match read_kernel_ptr(file, profile.file.inode) {
            Some(inode) if inode >> 48 == 0xffff => inode,
            _ => continue,
        };
        let inode_va = match VirtAddr::try_new(inode) {
            Ok(va) => va,
            Err(_) => continue,
        };
        let inode_pa = match walker.translate(inode_va, kernel_pgd) {
            Ok(translation) => translation.pa,
            Err(_) => continue,
        };
        let inode_offset = match space.pa_to_offset(inode_pa) {
            Ok(offset) => offset,
            Err(_) => continue,
        };

        let ino = ram
            .read_u64_le(inode_offset + profile.inode.ino as u64)
            .unwrap_or(0);
        let size = ram
            .read_u64_le(inode_offset + profile.inode.size as u64)
            .unwrap_or(0);
        let mode = ram
            .read_u32_le(inode_offset + profile.inode.mode as u64)
            .unwrap_or(0);

        open.push(OpenFile {
            fd,
            ino,
            size,
            mode,
        });
    }

    Some(open)
}
