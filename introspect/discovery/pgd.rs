// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Finding `swapper_pg_dir`, the kernel's translation-table root.
//!
//! KASLR moves the kernel PGD on every boot, so discovery scores every
//! 4 KiB page in guest RAM as a candidate. A real kernel PGD is a very
//! particular object: nearly empty, with a user linear-map entry at
//! index 0, a kernel linear-map entry at 256, and one or two high
//! entries for the kernel image and fixmap. The scorer rewards exactly
//! that shape; the driver then validates the best candidates by
//! translating kernel addresses the guest demonstrably uses.

use guestram::{GuestRam, ReadError};
use memory::{AddressSpace, PhysAddr, VirtAddr, ENTRIES_PER_TABLE, PAGE_SIZE};
use pagewalk::Walker;
use crate::CancelToken;

// Kernel PGDs are sparse. Pages outside these bounds are data,
// not translation roots.
const MIN_POPULATED: usize = 2;
const MAX_POPULATED: usize = 20;

// Contiguous-PUD population counts observed under real kernels'
// user linear maps.
const PUD_RUN_LENGTHS: [usize; 7] = [1, 2, 4, 6, 8, 16, 32];

// Sparse pages are everywhere on a real image; only candidates
// showing at least this much PGD shape are worth keeping.
const MIN_SCORE: u32 = 2;

/// One page that scored as a possible kernel PGD.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct PgdCandidate {
    pub pa: PhysAddr,
    pub score: u32,
}

/// Scans `[start, end)` of the RAM file for PGD candidates.
///
/// Returns candidates in ascending file-offset order. The scan
/// stops early, returning what it has, when `cancel` triggers.
///
pub(crate) fn scan_range(
    ram: &GuestRam,
    space: &AddressSpace,
    start: u64,
    end: u64,
    cancel: &CancelToken,
) -> Result<Vec<PgdCandidate>, ReadError> {
    let mut found = Vec::new();
    let end = end.min(ram.total_size());

    let mut offset = memory::align_up(start, PAGE_SIZE);
    while offset + PAGE_SIZE <= end {
        if cancel.is_cancelled() {
            break;
        }

        let window = ram.window_at(offset)?;
        let within = (offset - window.base_offset()) as usize;
        let window_end = window.len() - window.len() % PAGE_SIZE as usize;

        for page in (within..window_end).step_by(PAGE_SIZE as usize) {
            let absolute = window.base_offset() + page as u64;
            if absolute + PAGE_SIZE > end {
                break;
            }

            let entries = parse_entries(&window[page..page + PAGE_SIZE as usize]);
            let score = score_page(&entries, &mut |pud| read_entries(ram, space, pud));
            if let Some(score) = score {
                if score >= MIN_SCORE {
                    found.push(PgdCandidate {
                        pa: space.offset_to_pa(absolute),
                        score,
                    });
                }
            }
        }

        let next = window.base_offset() + window_end as u64;
        if next <= offset {
            break;
        }
        offset = next;
    }

    Ok(found)
}

/// Scores one page, viewed as 512 descriptors, as a kernel PGD
/// candidate.
///
/// Returns `None` for pages that cannot be a PGD at all: fewer
/// than 2 or more than 20 populated entries. `pud_entries` reads
/// the table a descriptor points at, for the contiguity bonus.
///
pub(crate) fn score_page<F>(entries: &[u64], pud_entries: &mut F) -> Option<u32>
where
    F: FnMut(PhysAddr) -> Option<Vec<u64>>,
{
    debug_assert_eq!(entries.len(), ENTRIES_PER_TABLE);

    let populated: Vec<usize> = (0..entries.len()).filter(|&i| entries[i] != 0).collect();
    if populated.len() < MIN_POPULATED || populated.len() > MAX_POPULATED {
        return None;
    }

    let mut score = 0;

    // Entry 0: the user half's linear map.
    let entry0 = entries[0];
    if entry0 & 1 == 1 {
        score += 1;

        // A user PUD populated contiguously from index 0, in one
        // of the run lengths RAM sizes produce, is a strong
        // signal.
        if entry0 & 0b11 == 0b11 {
            let pud_pa = PhysAddr::try_new(entry0 & 0x0000_ffff_ffff_f000).ok();
            if let Some(pud) = pud_pa.and_then(|pa| pud_entries(pa)) {
                let run: Vec<usize> = (0..pud.len()).filter(|&i| pud[i] != 0).collect();
                let contiguous = run.iter().copied().eq(0..run.len());
                if contiguous && PUD_RUN_LENGTHS.contains(&run.len()) {
                    score += 3;
                }
            }
        }
    }

    // Entry 256: the kernel half's linear map.
    if entries[256] != 0 {
        score += 1;
    }

    // High kernel entries: image, fixmap, vmemmap.
    if populated.iter().any(|&i| i >= 500) {
        score += 1;
    }

    // Exactly one user entry, and it is entry 0.
    let user: Vec<usize> = populated.iter().copied().filter(|&i| i < 256).collect();
    if user == [0] {
        score += 1;
    }

    // At least two kernel entries.
    if populated.iter().filter(|&&i| i >= 256).count() >= 2 {
        score += 1;
    }

    Some(score)
}

/// Returns whether `pgd` translates every probe address to a
/// physical address inside guest RAM.
///
/// An empty probe list validates nothing and fails.
///
pub(crate) fn validate(walker: &Walker, pgd: PhysAddr, probes: &[VirtAddr]) -> bool {
    !probes.is_empty() && probes.iter().all(|&va| walker.translate(va, pgd).is_ok())
}

/// Reads a table page as raw descriptor words.
///
fn read_entries(ram: &GuestRam, space: &AddressSpace, table: PhysAddr) -> Option<Vec<u64>> {
    let offset = space.pa_to_offset(table).ok()?;
    let bytes = ram.read_bytes(offset, PAGE_SIZE).ok()?;
    Some(parse_entries(&bytes))
}

fn parse_entries(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0_u8; 8];
            raw.copy_from_slice(chunk);
            u64::from_le_bytes(raw)
        })
        .collect()
}
