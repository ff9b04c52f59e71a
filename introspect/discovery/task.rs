// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Finding `task_struct`s by SLAB-aware signature search.
//!
//! `task_struct` is a ~9 KiB object allocated from a dedicated slab
//! cache, which packs objects at consistent sub-page offsets within
//! 32 KiB slabs. Rather than trusting any fixed offset list, the scan
//! first probes a prefix of RAM on a fine grid, clusters the sub-page
//! offsets of the raw hits, and then sweeps all of RAM trying only the
//! clustered offsets at every 4 KiB page.
//!
//! A signature match alone is weak (comm-shaped byte runs occur in
//! file caches too), so candidates are cross-validated through the
//! kernel's circular task list: a candidate is accepted only when one
//! of its list pointers translates, under the kernel PGD, to another
//! candidate whose opposite pointer translates back.
//!
//! The scans read fields straight out of the mapped window wherever a
//! field lies inside it, falling back to ordinary reads only at window
//! boundaries; the sweep touches every page of a multi-gigabyte image
//! and per-field locking would dominate it otherwise.

use crate::profile::KernelProfile;
use crate::CancelToken;
use guestram::{GuestRam, ReadError, Window};
use memory::{AddressSpace, PhysAddr, VirtAddr, PAGE_SIZE};
use pagewalk::Walker;
use std::collections::BTreeMap;

// The kernel's PID_MAX_LIMIT on 64-bit configurations.
const PID_MAX: u32 = 4_194_304;

// The probe pass tries signatures on this grid within each page.
const PROBE_GRID: u64 = 64;

// Offsets must recur this often in the probe pass to count as a
// slab phase.
const MIN_CLUSTER_HITS: u32 = 3;

// At most this many clustered offsets are kept.
const MAX_OFFSETS: usize = 8;

/// A raw signature hit: everything read from one candidate
/// `task_struct` base.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct TaskCandidate {
    /// The file offset of the candidate base.
    pub offset: u64,

    /// The guest physical address of the candidate base.
    pub pa: PhysAddr,

    pub pid: u32,
    pub tgid: u32,
    pub comm: String,

    /// The raw `tasks.next` and `tasks.prev` list pointers.
    pub tasks_next: u64,
    pub tasks_prev: u64,

    /// The raw `mm` pointer: 0 for kernel threads.
    pub mm: u64,
}

impl TaskCandidate {
    /// Returns the physical address of the candidate's embedded
    /// `tasks` list head, which is what neighbouring tasks' list
    /// pointers reference.
    ///
    pub(crate) fn tasks_field_pa(&self, profile: &KernelProfile) -> PhysAddr {
        self.pa + profile.task.tasks as u64
    }
}

/// Reads candidate fields from the mapped window when they fall
/// inside it, from the guest RAM handle otherwise.
///
struct Fields<'scan> {
    ram: &'scan GuestRam,
    window: Option<(&'scan Window, usize)>,
    base: u64,
}

impl<'scan> Fields<'scan> {
    fn at(ram: &'scan GuestRam, window: &'scan Window, base: u64) -> Self {
        let within = (base - window.base_offset()) as usize;
        Fields {
            ram,
            window: Some((window, within)),
            base,
        }
    }

    fn without_window(ram: &'scan GuestRam, base: u64) -> Self {
        Fields {
            ram,
            window: None,
            base,
        }
    }

    fn slice(&self, rel: u32, len: usize) -> Option<&'scan [u8]> {
        let (window, within) = self.window?;
        let at = within + rel as usize;
        if at + len <= window.len() {
            Some(&window[at..at + len])
        } else {
            None
        }
    }

    fn u32(&self, rel: u32) -> Option<u32> {
        if let Some(slice) = self.slice(rel, 4) {
            let mut buf = [0_u8; 4];
            buf.copy_from_slice(slice);
            return Some(u32::from_le_bytes(buf));
        }
        self.ram.read_u32_le(self.base + rel as u64).ok()
    }

    fn u64(&self, rel: u32) -> Option<u64> {
        if let Some(slice) = self.slice(rel, 8) {
            let mut buf = [0_u8; 8];
            buf.copy_from_slice(slice);
            return Some(u64::from_le_bytes(buf));
        }
        self.ram.read_u64_le(self.base + rel as u64).ok()
    }

    fn comm(&self, rel: u32) -> Option<[u8; 16]> {
        let mut buf = [0_u8; 16];
        if let Some(slice) = self.slice(rel, 16) {
            buf.copy_from_slice(slice);
            return Some(buf);
        }
        let bytes = self.ram.read_bytes(self.base + rel as u64, 16).ok()?;
        buf.copy_from_slice(&bytes);
        Some(buf)
    }
}

/// Checks the `task_struct` signature at a candidate base.
///
/// The checks, cheapest first: a plausible pid and tgid, a
/// printable NUL-terminated command name, kernel-half list
/// pointers, and an `mm` that is NULL or a kernel pointer.
///
pub(crate) fn check_signature(
    ram: &GuestRam,
    space: &AddressSpace,
    profile: &KernelProfile,
    offset: u64,
) -> Option<TaskCandidate> {
    signature(&Fields::without_window(ram, offset), space, profile, offset)
}

fn signature(
    fields: &Fields,
    space: &AddressSpace,
    profile: &KernelProfile,
    offset: u64,
) -> Option<TaskCandidate> {
    let task = &profile.task;

    let pid = fields.u32(task.pid)?;
    if pid >= PID_MAX {
        return None;
    }
    let tgid = fields.u32(task.tgid)?;
    if tgid >= PID_MAX {
        return None;
    }

    let comm = printable_comm(&fields.comm(task.comm)?)?;

    let tasks_next = fields.u64(task.tasks)?;
    let tasks_prev = fields.u64(task.tasks + 8)?;
    if tasks_next >> 48 != 0xffff || tasks_prev >> 48 != 0xffff {
        return None;
    }

    let mm = fields.u64(task.mm)?;
    if mm != 0 && mm >> 48 != 0xffff {
        return None;
    }

    Some(TaskCandidate {
        offset,
        pa: space.offset_to_pa(offset),
        pid,
        tgid,
        comm,
        tasks_next,
        tasks_prev,
        mm,
    })
}

/// Derives the slab sub-page offsets for this image.
///
/// Probes pages in `[0, span)` on a fine grid until `hit_target`
/// raw hits accumulate, clusters the hit offsets modulo the page
/// size, and unions the result with the profile's hint list. The
/// hints alone are the fallback when the probe finds too little.
///
pub(crate) fn probe_offsets(
    ram: &GuestRam,
    space: &AddressSpace,
    profile: &KernelProfile,
    span: u64,
    hit_target: usize,
    cancel: &CancelToken,
) -> Result<Vec<u64>, ReadError> {
    let mut histogram: BTreeMap<u64, u32> = BTreeMap::new();
    let mut hits = 0_usize;

    let end = span.min(ram.total_size());
    let mut page = 0_u64;
    'scan: while page + PAGE_SIZE <= end {
        if cancel.is_cancelled() {
            break;
        }

        let window = ram.window_at(page)?;
        for sub in (0..PAGE_SIZE).step_by(PROBE_GRID as usize) {
            let base = page + sub;
            let fields = Fields::at(ram, &window, base);
            if signature(&fields, space, profile, base).is_some() {
                *histogram.entry(sub).or_insert(0) += 1;
                hits += 1;
                if hits >= hit_target {
                    break 'scan;
                }
            }
        }

        page += PAGE_SIZE;
    }

    // Strongest clusters first.
    let mut clustered: Vec<(u64, u32)> = histogram
        .into_iter()
        .filter(|&(_, count)| count >= MIN_CLUSTER_HITS)
        .collect();
    clustered.sort_by(|left, right| right.1.cmp(&left.1).then(left.0.cmp(&right.0)));

    let mut offsets: Vec<u64> = clustered
        .into_iter()
        .take(MAX_OFFSETS)
        .map(|(offset, _)| offset)
        .collect();

    for &hint in &profile.slab_offsets {
        let hint = hint as u64 % PAGE_SIZE;
        if !offsets.contains(&hint) {
            offsets.push(hint);
        }
    }

    Ok(offsets)
}

/// Scans `[start, end)` for task candidates at the given sub-page
/// offsets.
///
/// Returns candidates in ascending file-offset order; stops early
/// on cancellation.
///
pub(crate) fn scan_range(
    ram: &GuestRam,
    space: &AddressSpace,
    profile: &KernelProfile,
    sub_offsets: &[u64],
    start: u64,
    end: u64,
    cancel: &CancelToken,
) -> Result<Vec<TaskCandidate>, ReadError> {
    let mut found = Vec::new();
    let end = end.min(ram.total_size());

    let mut page = memory::align_up(start, PAGE_SIZE);
    while page + PAGE_SIZE <= end {
        if cancel.is_cancelled() {
            break;
        }

        let window = ram.window_at(page)?;
        for &sub in sub_offsets {
            let base = page + sub;
            let fields = Fields::at(ram, &window, base);
            if let Some(candidate) = signature(&fields, space, profile, base) {
                found.push(candidate);
            }
        }

        page += PAGE_SIZE;
    }

    Ok(found)
}

/// Cross-validates candidates through the circular task list.
///
/// A candidate survives when one of its list pointers translates
/// under `kernel_pgd` to another candidate's `tasks` field, and
/// that candidate's opposite pointer translates back. Order is
/// preserved. Returns the survivors and the rejected count.
///
pub(crate) fn cross_validate(
    walker: &Walker,
    kernel_pgd: PhysAddr,
    candidates: &[TaskCandidate],
    profile: &KernelProfile,
) -> (Vec<TaskCandidate>, u64) {
    // Index every candidate by the physical address of its tasks
    // field.
    let by_tasks_pa: BTreeMap<u64, usize> = candidates
        .iter()
        .enumerate()
        .map(|(index, candidate)| (candidate.tasks_field_pa(profile).as_u64(), index))
        .collect();

    let resolve = |raw: u64| -> Option<u64> {
        let va = VirtAddr::try_new(raw).ok()?;
        walker.translate(va, kernel_pgd).ok().map(|t| t.pa.as_u64())
    };

    let mut accepted = Vec::new();
    let mut rejected = 0_u64;

    for (index, candidate) in candidates.iter().enumerate() {
        let own_pa = candidate.tasks_field_pa(profile).as_u64();

        // Forward: our next's prev must come back to us.
        let forward = resolve(candidate.tasks_next)
            .and_then(|pa| by_tasks_pa.get(&pa))
            .map_or(false, |&next_index| {
                next_index != index
                    && resolve(candidates[next_index].tasks_prev) == Some(own_pa)
            });

        // Backward: our prev's next must come back to us.
        let backward = resolve(candidate.tasks_prev)
            .and_then(|pa| by_tasks_pa.get(&pa))
            .map_or(false, |&prev_index| {
                prev_index != index
                    && resolve(candidates[prev_index].tasks_next) == Some(own_pa)
            });

        if forward || backward {
            accepted.push(candidate.clone());
        } else {
            rejected += 1;
        }
    }

    (accepted, rejected)
}

/// Extracts a printable, NUL-terminated command name from the 16
/// comm bytes, rejecting anything else.
///
fn printable_comm(bytes: &[u8]) -> Option<String> {
    let nul = bytes.iter().position(|&b| b == 0)?;
    if nul == 0 {
        return None;
    }

    let name = &bytes[..nul];
    if !name.iter().all(|&b| (0x20..0x7f).contains(&b)) {
        return None;
    }

    Some(String::from_utf8_lossy(name).into_owned())
}

#[cfg(test)]
mod test {
    use super::printable_comm;

    #[test]
    fn test_printable_comm() {
        let mut comm = [0_u8; 16];
        comm[..9].copy_from_slice(b"swapper/0");
        assert_eq!(printable_comm(&comm).as_deref(), Some("swapper/0"));

        // Unterminated.
        assert_eq!(printable_comm(&[0x41; 16]), None);

        // Empty.
        assert_eq!(printable_comm(&[0; 16]), None);

        // Non-printable bytes before the terminator.
        let mut comm = [0_u8; 16];
        comm[0] = 0x01;
        comm[1] = 0x02;
        comm[2] = 0x03;
        assert_eq!(printable_comm(&comm), None);

        // A tab is not printable either.
        let mut comm = [0_u8; 16];
        comm[..3].copy_from_slice(b"a\tb");
        assert_eq!(printable_comm(&comm), None);
    }
}
