// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Assembling and classifying process memory sections.
//!
//! When the in-guest companion is present, its round-robin blocks carry
//! a `/proc/<pid>/maps`-equivalent section list per process; those are
//! hints, sanitised and classified by path and permissions. Without a
//! companion, sections are synthesised from the discovered mappings: a
//! run of virtually-contiguous pages with one protection becomes one
//! section, classified heuristically.

use crate::beacon::{BeaconVma, ProcessRecord};
use crate::process::{MemorySection, PteRecord};
use memory::{Protection, VirtAddr};
use pagedb::SectionKind;

// Companion section-kind codes, as published in beacon blocks.
const BEACON_KIND_CODE: u32 = 1;
const BEACON_KIND_DATA: u32 = 2;
const BEACON_KIND_HEAP: u32 = 3;
const BEACON_KIND_STACK: u32 = 4;
const BEACON_KIND_LIBRARY: u32 = 5;
const BEACON_KIND_FILE: u32 = 6;
const BEACON_KIND_KERNEL: u32 = 7;

/// Builds sections from a companion process record.
///
/// Malformed entries (inverted or non-canonical ranges) are
/// dropped; everything kept is reclassified locally rather than
/// trusting the companion's kind outright when a path gives a
/// stronger answer.
///
pub(crate) fn sections_from_beacon(record: &ProcessRecord) -> Vec<MemorySection> {
    let mut sections = Vec::with_capacity(record.vmas.len());

    for vma in &record.vmas {
        let (start, end) = match (VirtAddr::try_new(vma.start), VirtAddr::try_new(vma.end)) {
            (Ok(start), Ok(end)) if start < end => (start, end),
            _ => continue,
        };

        let protection = beacon_protection(vma.prot);
        sections.push(MemorySection {
            start,
            end,
            protection,
            kind: classify(vma, protection, start),
            backing: vma.name.clone(),
        });
    }

    sections.sort_by_key(|section| section.start);
    sections
}

/// Synthesises sections from a process's discovered mappings.
///
/// Consecutive records that are virtually contiguous and share a
/// protection merge into one section. Classification is
/// heuristic: kernel-half sections are kernel, executable ones
/// code, and of the writable anonymous runs the highest-addressed
/// is taken for the stack and the one nearest above the code for
/// the heap.
///
pub(crate) fn synthesize_sections(ptes: &[PteRecord]) -> Vec<MemorySection> {
    let mut sections: Vec<MemorySection> = Vec::new();

    for record in ptes {
        let end = match record.va.checked_add(record.size.bytes()) {
            Some(end) => end,
            None => continue,
        };

        if let Some(last) = sections.last_mut() {
            if last.end == record.va && last.protection == record.protection {
                last.end = end;
                continue;
            }
        }

        sections.push(MemorySection {
            start: record.va,
            end,
            protection: record.protection,
            kind: SectionKind::Anonymous,
            backing: None,
        });
    }

    // First pass of kinds: position-independent rules.
    for section in &mut sections {
        section.kind = if section.start.is_kernel() {
            SectionKind::Kernel
        } else if section.protection.executable() {
            SectionKind::Code
        } else if section.protection.writable() {
            SectionKind::Data
        } else {
            SectionKind::Anonymous
        };
    }

    // The highest-addressed writable user section is almost
    // certainly the stack.
    if let Some(stack) = sections
        .iter_mut()
        .filter(|s| !s.start.is_kernel() && s.protection.writable())
        .last()
    {
        stack.kind = SectionKind::Stack;
    }

    // The first writable section above the last code section is
    // the best heap candidate.
    let code_end = sections
        .iter()
        .filter(|s| s.kind == SectionKind::Code)
        .map(|s| s.end)
        .max();
    if let Some(code_end) = code_end {
        if let Some(heap) = sections
            .iter_mut()
            .find(|s| s.kind == SectionKind::Data && s.start >= code_end)
        {
            heap.kind = SectionKind::Heap;
        }
    }

    sections
}

/// Converts companion protection bits to a [`Protection`].
///
fn beacon_protection(prot: u32) -> Protection {
    let mut protection = Protection::empty();
    if prot & 0b001 != 0 {
        protection |= Protection::READ;
    }
    if prot & 0b010 != 0 {
        protection |= Protection::WRITE;
    }
    if prot & 0b100 != 0 {
        protection |= Protection::EXECUTE;
    }
    protection
}

/// Classifies one companion section.
///
/// Path rules take precedence; the companion's own kind code and
/// the permissions fill in the rest.
///
fn classify(vma: &BeaconVma, protection: Protection, start: VirtAddr) -> SectionKind {
    if start.is_kernel() {
        return SectionKind::Kernel;
    }

    if let Some(name) = vma.name.as_deref() {
        if name == "[stack]" {
            return SectionKind::Stack;
        }
        if name == "[heap]" {
            return SectionKind::Heap;
        }
        if name.contains(".so") {
            return SectionKind::Library;
        }
        if protection.executable() {
            return SectionKind::Code;
        }
        if protection.writable() {
            return SectionKind::Data;
        }
        return SectionKind::FileBacked;
    }

    match vma.kind {
        BEACON_KIND_CODE => SectionKind::Code,
        BEACON_KIND_DATA => SectionKind::Data,
        BEACON_KIND_HEAP => SectionKind::Heap,
        BEACON_KIND_STACK => SectionKind::Stack,
        BEACON_KIND_LIBRARY => SectionKind::Library,
        BEACON_KIND_FILE => SectionKind::FileBacked,
        BEACON_KIND_KERNEL => SectionKind::Kernel,
        _ => {
            if protection.executable() {
                SectionKind::Code
            } else {
                SectionKind::Anonymous
            }
        }
    }
}
