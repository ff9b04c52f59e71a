// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Walking resolved translation tables into the page database.
//!
//! For each process with a resolved user PGD, and once for the kernel
//! PGD, every terminal mapping becomes a [`PteRecord`] owned by the
//! process and a reference in the [`PageDb`]. A defensive global cap
//! bounds the total record count; hitting it truncates the result
//! rather than failing.

use crate::process::PteRecord;
use guestram::{GuestRam, ReadError};
use memory::{AddressSpace, PhysAddr, PAGE_SIZE};
use pagedb::{PageDb, PageRef, RefKind};
use pagewalk::{Fault, VaRange, WalkControl, WalkStats, Walker};

/// The outcome of walking one translation root.
///
#[derive(Debug)]
pub(crate) struct ProcessWalk {
    /// Terminal mappings, in table order.
    pub ptes: Vec<PteRecord>,

    /// The walker's skip counters.
    pub stats: WalkStats,

    /// Whether the global record cap stopped the walk early.
    pub truncated: bool,
}

/// Walks the translation tables rooted at `pgd`, appending a
/// reference for every terminal mapping to `db` and returning the
/// records.
///
/// At most `cap` records are emitted; the walk then stops with
/// `truncated` set.
///
pub(crate) fn walk_into(
    walker: &Walker,
    pgd: PhysAddr,
    range: VaRange,
    pid: u32,
    comm: &str,
    cap: u64,
    db: &mut PageDb,
) -> Result<ProcessWalk, ReadError> {
    let mut ptes = Vec::new();
    let mut truncated = false;

    let stats = walker
        .walk(pgd, range, &mut |va, translation| {
            if (ptes.len() as u64) >= cap {
                truncated = true;
                return WalkControl::Stop;
            }

            ptes.push(PteRecord {
                va,
                pa: translation.pa,
                protection: translation.protection,
                size: translation.size,
                pid,
            });
            db.insert(
                translation.pa,
                PageRef {
                    pid,
                    comm: comm.to_string(),
                    kind: RefKind::Pte,
                    va,
                    protection: translation.protection,
                    section: None,
                    size: translation.size.bytes(),
                },
            );

            WalkControl::Continue
        })
        .map_err(|fault| match fault {
            Fault::Io(err) => err,
            // The enumeration swallows recoverable faults into its
            // counters; only I/O escapes.
            other => unreachable!("recoverable fault escaped enumeration: {}", other),
        })?;

    Ok(ProcessWalk {
        ptes,
        stats,
        truncated,
    })
}

/// Reads the page containing `pa` and reports whether all 4096
/// bytes are zero.
///
/// Unreadable pages are reported as not zero.
///
pub(crate) fn is_zero_page(ram: &GuestRam, space: &AddressSpace, pa: PhysAddr) -> bool {
    let offset = match space.pa_to_offset(pa.align_down(PAGE_SIZE)) {
        Ok(offset) => offset,
        Err(_) => return false,
    };

    match ram.read_bytes(offset, PAGE_SIZE) {
        Ok(bytes) => bytes.iter().all(|&b| b == 0),
        Err(_) => false,
    }
}
