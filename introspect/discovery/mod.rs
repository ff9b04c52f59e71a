// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The discovery driver: five phases, each narrowing the next.
//!
//! Discovery is one-shot: the caller invokes [`discover`] (or steps a
//! [`DiscoveryDriver`] by hand), receives a [`Discovery`], and queries it.
//! The driver is a cooperative state machine: each [`step`](DiscoveryDriver::step)
//! advances a bounded quantum and reports progress, so a UI can poll it.
//! The phases are:
//!
//! 1. *Orientation.* Read the `Linux version` banner from low memory to
//!    select a kernel profile, and ask the optional oracle for `TTBR1_EL1`.
//! 2. *Kernel PGD.* Score every page as a `swapper_pg_dir` candidate
//!    (skipped when the oracle answered), then validate the best against
//!    kernel addresses taken from task candidates.
//! 3. *Tasks.* Derive the slab sub-page offsets, sweep RAM for
//!    `task_struct` signatures, and cross-validate them through the
//!    circular task list.
//! 4. *Per-process state.* Resolve each task's `mm_struct` and user PGD;
//!    locate companion beacons; assemble and classify memory sections;
//!    recover open files.
//! 5. *Mappings.* Walk the kernel PGD and every user PGD, filling the
//!    [`PageDb`] and each process's record list, then freeze the
//!    database.
//!
//! Scan phases fan out over a worker pool when enabled: each worker owns
//! a disjoint file-offset range and a private result vector, merged in
//! range order at the phase end. Nothing is published to the caller
//! until the driver returns.

mod fdtable;
mod pagetables;
mod pgd;
mod task;
mod vma;
mod walk;

use crate::beacon::{self, BeaconHeader, ProcessRecord};
use crate::process::{ProcessInfo, PteRecord};
use crate::profile::KernelProfile;
use crate::{CancelToken, Context};
use guestram::{GuestRam, ReadError};
use memory::{PhysAddr, VirtAddr, PAGE_SIZE};
use pagedb::{PageDb, PageEntry, PageRef, RefKind};
use pagewalk::Walker;
use self::pgd::PgdCandidate;
use self::task::TaskCandidate;
use pretty::{Bytes, Count};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

// TTBR1_EL1 carries the table address in bits 47..12; the ASID
// and CnP bits around it must go.
const TTBR_ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;

// How many kernel addresses the PGD validation probes.
const PGD_PROBES: usize = 5;

// How many processes one driver step walks.
const WALK_BATCH: usize = 16;

/// A discovery failure. Cancellation is not one: a cancelled run
/// returns a partial [`Discovery`] flagged `cancelled`.
///
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The guest RAM file failed underneath discovery.
    #[error("guest RAM I/O failure")]
    Io(#[from] ReadError),
}

/// A progress report from one driver step.
///
#[derive(Clone, Debug)]
pub struct Progress {
    /// The phase the step advanced.
    pub phase: &'static str,

    /// Work done within the phase, in phase-specific units
    /// (bytes for scans, items otherwise).
    pub done: u64,

    /// Total work in the phase.
    pub total: u64,
}

/// Counters describing what one discovery pass found and what it
/// recovered from. Every recoverable error in the engine ends up
/// here rather than in a result type.
///
#[derive(Clone, Debug, Default)]
pub struct DiscoveryStats {
    /// The `Linux version` banner, when one was found.
    pub kernel_version: Option<String>,

    /// The selected profile's version key.
    pub profile_version: String,

    /// The slab sub-page offsets the task scan used.
    pub slab_offsets: Vec<u64>,

    /// Pages that scored as kernel-PGD candidates.
    pub pgd_candidates: u64,

    /// The accepted candidate's score (0 when the oracle answered).
    pub pgd_score: u32,

    /// Whether the accepted PGD passed the translation probes.
    pub pgd_validated: bool,

    /// Whether the accepted PGD came from the oracle.
    pub pgd_from_oracle: bool,

    /// Raw task-signature hits before cross-validation.
    pub task_raw_hits: u64,

    /// Tasks accepted into the process list.
    pub tasks_accepted: u64,

    /// Candidates rejected by list cross-validation.
    pub tasks_rejected: u64,

    /// Accepted tasks with no userspace.
    pub kernel_threads: u64,

    /// Accepted tasks whose translation root could not be
    /// resolved.
    pub pagetable_unresolved: u64,

    /// Populated descriptors with clear valid bits, skipped.
    pub invalid_descriptors: u64,

    /// Descriptors pointing outside guest RAM, skipped.
    pub dangling_descriptors: u64,

    /// Terminal mappings emitted across the kernel and all
    /// processes.
    pub pte_records: u64,

    /// Verified beacon pages found.
    pub beacon_pages: u64,

    /// Process records consumed from beacon blocks.
    pub beacon_processes: u64,

    /// Pids consumed from the beacon pid list.
    pub beacon_pids: u64,

    /// Open files recovered across all processes.
    pub open_files: u64,

    /// Processes whose file-table walk failed.
    pub fdtable_failures: u64,

    /// The frozen page database's own statistics.
    pub pages: pagedb::Statistics,

    /// The fraction of accepted tasks whose page tables resolved.
    pub completeness: f32,
}

impl std::fmt::Display for DiscoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} processes ({} kernel threads), {} mappings over {} pages ({}), \
             {} shared, {} kernel, {} zero",
            Count::new(self.tasks_accepted),
            Count::new(self.kernel_threads),
            Count::new(self.pte_records),
            Count::new(self.pages.total_pages),
            Bytes::new(self.pages.total_pages * PAGE_SIZE),
            Count::new(self.pages.shared),
            Count::new(self.pages.kernel),
            Count::new(self.pages.zero),
        )
    }
}

/// The single output of one discovery pass.
///
#[derive(Debug)]
pub struct Discovery {
    /// The accepted kernel PGD, absent only when every candidate
    /// failed.
    pub swapper_pgd: Option<PhysAddr>,

    /// Discovered processes, in ascending task_struct file-offset
    /// order.
    pub processes: Vec<ProcessInfo>,

    /// The kernel's own terminal mappings (pid 0).
    pub kernel_ptes: Vec<PteRecord>,

    /// The frozen inverted page index.
    pub pages: PageDb,

    /// What was found and what was recovered from.
    pub stats: DiscoveryStats,

    /// Whether cancellation cut the pass short.
    pub cancelled: bool,

    /// Whether the record cap cut the mapping walk short.
    pub truncated: bool,
}

impl Discovery {
    /// Returns the process with the given pid, if discovered.
    ///
    pub fn process(&self, pid: u32) -> Option<&ProcessInfo> {
        self.processes.iter().find(|process| process.pid == pid)
    }

    /// Returns every reference to the page containing `pa`.
    ///
    pub fn page_references(&self, pa: PhysAddr) -> &[PageRef] {
        self.pages
            .get(pa)
            .map(|entry| entry.references())
            .unwrap_or(&[])
    }

    /// Returns the page entry for `pa`, if any.
    ///
    pub fn page_info(&self, pa: PhysAddr) -> Option<&PageEntry> {
        self.pages.get(pa)
    }

    /// Iterates over the physical pages referenced by `pid`.
    ///
    pub fn process_pages(&self, pid: u32) -> impl Iterator<Item = PhysAddr> + '_ {
        self.pages.process_pages(pid)
    }

    /// Iterates over shared pages with the pids referencing each.
    ///
    pub fn shared_pages(&self) -> impl Iterator<Item = (PhysAddr, Vec<u32>)> + '_ {
        self.pages.shared_pages().map(|entry| {
            (
                entry.phys_addr(),
                entry.distinct_pids().into_iter().collect(),
            )
        })
    }
}

/// Runs one complete discovery pass.
///
pub fn discover(ctx: &Context, cancel: &CancelToken) -> Result<Discovery, DiscoveryError> {
    DiscoveryDriver::new(ctx).run(cancel)
}

#[derive(Clone, Copy)]
enum State {
    Orient,
    ScanPgd { next: u64 },
    ProbeOffsets,
    ScanTasks { next: u64 },
    SelectPgd,
    ResolveTables,
    ScanBeacon { next: u64 },
    ReadBeacons,
    WalkKernel,
    WalkProcesses { next: usize },
    Sections,
    OpenFiles,
    Freeze,
    Done,
}

/// The cooperative discovery state machine.
///
/// [`step`](DiscoveryDriver::step) advances one bounded quantum;
/// [`run`](DiscoveryDriver::run) drives steps to completion,
/// checking the cancellation token between them.
///
pub struct DiscoveryDriver<'ctx> {
    ctx: &'ctx Context,
    walker: Walker,
    state: State,

    profile: KernelProfile,
    slab_offsets: Vec<u64>,
    pgd_hint: Option<PhysAddr>,
    pgd_candidates: Vec<PgdCandidate>,
    raw_tasks: Vec<TaskCandidate>,
    accepted: Vec<TaskCandidate>,
    swapper: Option<PhysAddr>,

    processes: Vec<ProcessInfo>,
    beacons: Vec<(u64, BeaconHeader)>,
    beacon_processes: BTreeMap<u32, ProcessRecord>,
    walked_pgds: BTreeMap<u64, usize>,

    db: PageDb,
    kernel_ptes: Vec<PteRecord>,
    stats: DiscoveryStats,
    cancelled: bool,
    truncated: bool,
}

impl<'ctx> DiscoveryDriver<'ctx> {
    /// Creates a driver ready to take its first step.
    ///
    pub fn new(ctx: &'ctx Context) -> Self {
        let walker = Walker::new(ctx.ram().clone(), *ctx.address_space());
        let profile = ctx.profiles().select(None).clone();

        DiscoveryDriver {
            ctx,
            walker,
            state: State::Orient,
            profile,
            slab_offsets: Vec::new(),
            pgd_hint: None,
            pgd_candidates: Vec::new(),
            raw_tasks: Vec::new(),
            accepted: Vec::new(),
            swapper: None,
            processes: Vec::new(),
            beacons: Vec::new(),
            beacon_processes: BTreeMap::new(),
            walked_pgds: BTreeMap::new(),
            db: PageDb::new(),
            kernel_ptes: Vec::new(),
            stats: DiscoveryStats::default(),
            cancelled: false,
            truncated: false,
        }
    }

    /// Drives the state machine to completion and returns the
    /// result.
    ///
    /// The token is checked between steps; a cancelled run jumps
    /// straight to the freeze and returns what it has, flagged
    /// `cancelled`.
    ///
    pub fn run(self, cancel: &CancelToken) -> Result<Discovery, DiscoveryError> {
        self.run_with_progress(cancel, |_| {})
    }

    /// Like [`run`](DiscoveryDriver::run), reporting each step's
    /// progress.
    ///
    pub fn run_with_progress<F>(
        mut self,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> Result<Discovery, DiscoveryError>
    where
        F: FnMut(&Progress),
    {
        loop {
            if cancel.is_cancelled() && !matches!(self.state, State::Freeze | State::Done) {
                warn!("discovery cancelled; freezing partial result");
                self.cancelled = true;
                self.state = State::Freeze;
            }

            if matches!(self.state, State::Done) {
                return Ok(self.finish());
            }

            let progress = self.step(cancel)?;
            on_progress(&progress);
        }
    }

    /// Advances the machine by one bounded quantum.
    ///
    /// Calling `step` after the machine is done is a no-op.
    ///
    pub fn step(&mut self, cancel: &CancelToken) -> Result<Progress, DiscoveryError> {
        let ram_size = self.ctx.ram().total_size();
        let quantum = self.ctx.options().step_quantum.max(PAGE_SIZE);

        match self.state {
            State::Orient => {
                self.orient();
                self.state = if self.pgd_hint.is_some() {
                    State::ProbeOffsets
                } else {
                    State::ScanPgd { next: 0 }
                };
                Ok(Progress {
                    phase: "orient",
                    done: 1,
                    total: 1,
                })
            }

            State::ScanPgd { next } => {
                let (done, finished) =
                    self.scan_chunk(next, quantum, cancel, |driver, found: Vec<PgdCandidate>| {
                        driver.pgd_candidates.extend(found);
                    }, |ram, space, start, end, cancel| {
                        pgd::scan_range(ram, space, start, end, cancel)
                    })?;

                self.state = if finished {
                    State::ProbeOffsets
                } else {
                    State::ScanPgd { next: done }
                };
                Ok(Progress {
                    phase: "scan-pgd",
                    done,
                    total: ram_size,
                })
            }

            State::ProbeOffsets => {
                let options = self.ctx.options();
                self.slab_offsets = task::probe_offsets(
                    self.ctx.ram(),
                    self.ctx.address_space(),
                    &self.profile,
                    options.task_probe_span,
                    options.task_probe_hits,
                    cancel,
                )?;
                debug!(offsets = ?self.slab_offsets, "slab sub-page offsets");
                self.stats.slab_offsets = self.slab_offsets.clone();
                self.state = State::ScanTasks { next: 0 };
                Ok(Progress {
                    phase: "probe-offsets",
                    done: 1,
                    total: 1,
                })
            }

            State::ScanTasks { next } => {
                let profile = self.profile.clone();
                let offsets = self.slab_offsets.clone();
                let (done, finished) = self.scan_chunk(
                    next,
                    quantum,
                    cancel,
                    |driver, found: Vec<TaskCandidate>| {
                        driver.raw_tasks.extend(found);
                    },
                    move |ram, space, start, end, cancel| {
                        task::scan_range(ram, space, &profile, &offsets, start, end, cancel)
                    },
                )?;

                self.state = if finished {
                    State::SelectPgd
                } else {
                    State::ScanTasks { next: done }
                };
                Ok(Progress {
                    phase: "scan-tasks",
                    done,
                    total: ram_size,
                })
            }

            State::SelectPgd => {
                self.select_pgd();
                self.state = State::ResolveTables;
                Ok(Progress {
                    phase: "select-pgd",
                    done: 1,
                    total: 1,
                })
            }

            State::ResolveTables => {
                self.resolve_tables();
                self.state = State::ScanBeacon { next: 0 };
                let total = self.processes.len() as u64;
                Ok(Progress {
                    phase: "resolve-tables",
                    done: total,
                    total,
                })
            }

            State::ScanBeacon { next } => {
                let (done, finished) = self.scan_chunk(
                    next,
                    quantum,
                    cancel,
                    |driver, found: Vec<(u64, BeaconHeader)>| {
                        driver.beacons.extend(found);
                    },
                    |ram, _space, start, end, _cancel| beacon::scan_range(ram, start, end),
                )?;

                self.state = if finished {
                    State::ReadBeacons
                } else {
                    State::ScanBeacon { next: done }
                };
                Ok(Progress {
                    phase: "scan-beacon",
                    done,
                    total: ram_size,
                })
            }

            State::ReadBeacons => {
                self.read_beacons()?;
                self.state = State::WalkKernel;
                let total = self.beacons.len() as u64;
                Ok(Progress {
                    phase: "read-beacons",
                    done: total,
                    total,
                })
            }

            State::WalkKernel => {
                self.walk_kernel()?;
                self.state = State::WalkProcesses { next: 0 };
                Ok(Progress {
                    phase: "walk-kernel",
                    done: 1,
                    total: 1,
                })
            }

            State::WalkProcesses { next } => {
                let done = self.walk_processes(next)?;
                self.state = if done >= self.processes.len() {
                    State::Sections
                } else {
                    State::WalkProcesses { next: done }
                };
                Ok(Progress {
                    phase: "walk-processes",
                    done: done as u64,
                    total: self.processes.len() as u64,
                })
            }

            State::Sections => {
                self.assemble_sections();
                self.state = State::OpenFiles;
                let total = self.processes.len() as u64;
                Ok(Progress {
                    phase: "sections",
                    done: total,
                    total,
                })
            }

            State::OpenFiles => {
                self.collect_open_files();
                self.state = State::Freeze;
                let total = self.processes.len() as u64;
                Ok(Progress {
                    phase: "open-files",
                    done: total,
                    total,
                })
            }

            State::Freeze => {
                self.freeze();
                self.state = State::Done;
                Ok(Progress {
                    phase: "freeze",
                    done: 1,
                    total: 1,
                })
            }

            State::Done => Ok(Progress {
                phase: "done",
                done: 1,
                total: 1,
            }),
        }
    }

    // Phase bodies.

    /// Reads the version banner, selects the profile, and asks
    /// the oracle for the kernel PGD.
    ///
    fn orient(&mut self) {
        let span = self.ctx.options().banner_span;
        match find_banner(self.ctx.ram(), span) {
            Ok(Some(banner)) => {
                debug!(banner = banner.as_str(), "kernel version banner");
                self.profile = self.ctx.profiles().select(Some(&banner)).clone();
                self.stats.kernel_version = Some(banner);
            }
            Ok(None) => {
                debug!("no kernel version banner found; using first profile");
            }
            Err(err) => {
                // The banner is a convenience; a read failure here
                // will resurface fatally in the scans if real.
                warn!(error = %err, "banner scan failed");
            }
        }
        self.stats.profile_version = self.profile.version.clone();

        if let Some(oracle) = self.ctx.oracle() {
            match oracle.query_kernel_info(0) {
                Ok(info) => {
                    let masked = info.ttbr1 & TTBR_ADDR_MASK;
                    match PhysAddr::try_new(masked) {
                        Ok(pa) if self.ctx.address_space().contains(pa) => {
                            debug!(pgd = %pa, "kernel PGD from oracle");
                            self.pgd_hint = Some(pa);
                        }
                        _ => warn!(ttbr1 = info.ttbr1, "oracle TTBR1 outside guest RAM"),
                    }
                }
                Err(err) => {
                    debug!(error = %err, "oracle unavailable; scanning for kernel PGD");
                }
            }
        }
    }

    /// Interleaves phases 1 and 2: picks the PGD that translates
    /// kernel addresses taken from the task candidates, then
    /// cross-validates the tasks under it.
    ///
    fn select_pgd(&mut self) {
        // Fold away any duplicate hits; order stays ascending by
        // file offset.
        let mut seen = BTreeSet::new();
        self.raw_tasks.retain(|candidate| seen.insert(candidate.offset));
        self.stats.task_raw_hits = self.raw_tasks.len() as u64;
        self.stats.pgd_candidates = self.pgd_candidates.len() as u64;

        // Kernel addresses the guest demonstrably uses: the task
        // candidates' own list pointers.
        let mut probes: Vec<VirtAddr> = Vec::new();
        let mut seen_vas = BTreeSet::new();
        for candidate in &self.raw_tasks {
            if probes.len() >= PGD_PROBES {
                break;
            }
            if let Ok(va) = VirtAddr::try_new(candidate.tasks_next) {
                if seen_vas.insert(va.as_u64()) {
                    probes.push(va);
                }
            }
        }

        // Candidate order: the oracle's answer first, then scan
        // candidates by descending score.
        let mut ordered: Vec<(PhysAddr, u32, bool)> = Vec::new();
        if let Some(hint) = self.pgd_hint {
            ordered.push((hint, 0, true));
        }
        let mut scored = self.pgd_candidates.clone();
        scored.sort_by(|left, right| {
            right
                .score
                .cmp(&left.score)
                .then(left.pa.cmp(&right.pa))
        });
        ordered.extend(scored.iter().map(|c| (c.pa, c.score, false)));

        for (pa, score, from_oracle) in &ordered {
            if pgd::validate(&self.walker, *pa, &probes) {
                self.swapper = Some(*pa);
                self.stats.pgd_score = *score;
                self.stats.pgd_validated = true;
                self.stats.pgd_from_oracle = *from_oracle;
                break;
            }
        }

        // With nothing validated (typically because no task
        // candidate supplied probes), fall back to the best
        // unvalidated candidate rather than giving up.
        if self.swapper.is_none() {
            if let Some(&(pa, score, from_oracle)) = ordered.first() {
                warn!(pgd = %pa, "kernel PGD accepted without probe validation");
                self.swapper = Some(pa);
                self.stats.pgd_score = score;
                self.stats.pgd_from_oracle = from_oracle;
            }
        }

        match self.swapper {
            Some(pgd) => {
                debug!(pgd = %pgd, score = self.stats.pgd_score, "kernel PGD selected");
                let (accepted, rejected) =
                    task::cross_validate(&self.walker, pgd, &self.raw_tasks, &self.profile);
                self.stats.tasks_rejected = rejected;
                self.accepted = accepted;
            }
            None => {
                // No PGD at all: nothing can be validated or
                // resolved. Keep nothing rather than publish
                // unvalidated guesses.
                warn!("no kernel PGD candidate survived; returning empty process list");
            }
        }

        self.stats.tasks_accepted = self.accepted.len() as u64;
        self.processes = self
            .accepted
            .iter()
            .map(|candidate| ProcessInfo {
                pid: candidate.pid,
                tgid: candidate.tgid,
                comm: candidate.comm.clone(),
                is_kernel_thread: candidate.mm == 0,
                task_pa: candidate.pa,
                mm_pa: None,
                user_pgd: None,
                pagetable_unresolved: false,
                sections: Vec::new(),
                ptes: Vec::new(),
                open_files: Vec::new(),
            })
            .collect();
    }

    /// Resolves each accepted task's `mm` to its user PGD.
    ///
    fn resolve_tables(&mut self) {
        let swapper = match self.swapper {
            Some(swapper) => swapper,
            None => return,
        };

        for (index, process) in self.processes.iter_mut().enumerate() {
            let candidate = &self.accepted[index];
            if candidate.mm == 0 {
                self.stats.kernel_threads += 1;
                continue;
            }

            match pagetables::resolve_user_pgd(
                &self.walker,
                self.ctx.ram(),
                &self.profile,
                swapper,
                candidate.mm,
            ) {
                Some(resolved) => {
                    process.mm_pa = Some(resolved.mm_pa);
                    process.user_pgd = Some(resolved.user_pgd);
                }
                None => {
                    process.pagetable_unresolved = true;
                    self.stats.pagetable_unresolved += 1;
                }
            }
        }
    }

    /// Parses the beacon blocks found by the scan.
    ///
    fn read_beacons(&mut self) -> Result<(), DiscoveryError> {
        self.stats.beacon_pages = self.beacons.len() as u64;

        for (offset, header) in &self.beacons {
            match beacon::read_block(self.ctx.ram(), *offset, header)? {
                beacon::BeaconBlock::PidList(pids) => {
                    self.stats.beacon_pids += pids.len() as u64;
                }
                beacon::BeaconBlock::Processes(records) => {
                    for record in records {
                        // Later blocks carry fresher round-robin
                        // entries and override earlier ones.
                        self.beacon_processes.insert(record.pid, record);
                    }
                }
                beacon::BeaconBlock::Other(_) => {}
            }
        }

        self.stats.beacon_processes = self.beacon_processes.len() as u64;
        Ok(())
    }

    /// Walks the kernel PGD, emitting pid-0 records.
    ///
    fn walk_kernel(&mut self) -> Result<(), DiscoveryError> {
        let swapper = match self.swapper {
            Some(swapper) => swapper,
            None => return Ok(()),
        };

        let cap = self.remaining_records();
        let outcome = walk::walk_into(
            &self.walker,
            swapper,
            pagewalk::VaRange::Kernel,
            0,
            "kernel",
            cap,
            &mut self.db,
        )?;
        self.absorb_walk_stats(&outcome);
        self.kernel_ptes = outcome.ptes;
        Ok(())
    }

    /// Walks a batch of processes' user PGDs. Returns the index
    /// to resume from.
    ///
    fn walk_processes(&mut self, from: usize) -> Result<usize, DiscoveryError> {
        let until = (from + WALK_BATCH).min(self.processes.len());

        for index in from..until {
            let pgd = match self.processes[index].user_pgd {
                Some(pgd) => pgd,
                None => continue,
            };

            // Threads share their group's mm; walk each table
            // once and leave the siblings' record lists empty.
            if self.walked_pgds.contains_key(&pgd.as_u64()) {
                continue;
            }
            self.walked_pgds.insert(pgd.as_u64(), index);

            if self.truncated {
                continue;
            }

            let cap = self.remaining_records();
            let (pid, comm) = (self.processes[index].pid, self.processes[index].comm.clone());
            let outcome = walk::walk_into(
                &self.walker,
                pgd,
                pagewalk::VaRange::User,
                pid,
                &comm,
                cap,
                &mut self.db,
            )?;
            self.absorb_walk_stats(&outcome);
            self.processes[index].ptes = outcome.ptes;
        }

        Ok(until)
    }

    /// Attaches memory sections to every process and mirrors them
    /// into the page database.
    ///
    fn assemble_sections(&mut self) {
        for process in &mut self.processes {
            // Beacon data is a hint: it is consulted only for
            // processes discovery itself accepted.
            let from_beacon = self
                .beacon_processes
                .get(&process.pid)
                .filter(|record| record.comm == process.comm)
                .map(vma::sections_from_beacon);

            process.sections = match from_beacon {
                Some(sections) if !sections.is_empty() => sections,
                _ => vma::synthesize_sections(&process.ptes),
            };

            // Mirror each mapping's section membership into the
            // database.
            for record in &process.ptes {
                if let Some(section) = process
                    .sections
                    .iter()
                    .find(|section| section.contains(record.va))
                {
                    self.db.insert(
                        record.pa,
                        PageRef {
                            pid: process.pid,
                            comm: process.comm.clone(),
                            kind: RefKind::Section,
                            va: record.va,
                            protection: section.protection,
                            section: Some(section.kind),
                            size: section.size(),
                        },
                    );
                }
            }
        }
    }

    /// Recovers open files for every process with a file table.
    ///
    fn collect_open_files(&mut self) {
        let swapper = match self.swapper {
            Some(swapper) => swapper,
            None => return,
        };
        let space = self.ctx.address_space();
        let max_files = self.ctx.options().max_open_files;

        for process in &mut self.processes {
            if process.is_kernel_thread || process.pagetable_unresolved {
                continue;
            }
            let task_offset = match space.pa_to_offset(process.task_pa) {
                Ok(offset) => offset,
                Err(_) => continue,
            };

            match fdtable::walk_open_files(
                &self.walker,
                self.ctx.ram(),
                &self.profile,
                swapper,
                task_offset,
                max_files,
            ) {
                Some(open) => {
                    self.stats.open_files += open.len() as u64;
                    process.open_files = open;
                }
                None => self.stats.fdtable_failures += 1,
            }
        }
    }

    /// Derives page flags, freezes the database, and settles the
    /// final statistics.
    ///
    fn freeze(&mut self) {
        let ram = self.ctx.ram().clone();
        let space = *self.ctx.address_space();
        let limit = self.ctx.options().zero_probe_limit;
        self.db
            .freeze(|pa| walk::is_zero_page(&ram, &space, pa), limit);

        self.stats.pages = self.db.statistics();

        let with_userspace = self
            .processes
            .iter()
            .filter(|p| !p.is_kernel_thread)
            .count();
        let resolved = self
            .processes
            .iter()
            .filter(|p| p.user_pgd.is_some())
            .count();
        self.stats.completeness = if with_userspace == 0 {
            if self.cancelled {
                0.0
            } else {
                1.0
            }
        } else {
            resolved as f32 / with_userspace as f32
        };
    }

    fn finish(self) -> Discovery {
        Discovery {
            swapper_pgd: self.swapper,
            processes: self.processes,
            kernel_ptes: self.kernel_ptes,
            pages: self.db,
            stats: self.stats,
            cancelled: self.cancelled,
            truncated: self.truncated,
        }
    }

    // Helpers.

    fn remaining_records(&self) -> u64 {
        self.ctx
            .options()
            .max_pte_records
            .saturating_sub(self.stats.pte_records)
    }

    fn absorb_walk_stats(&mut self, outcome: &walk::ProcessWalk) {
        self.stats.pte_records += outcome.ptes.len() as u64;
        self.stats.invalid_descriptors += outcome.stats.invalid;
        self.stats.dangling_descriptors += outcome.stats.dangling;
        if outcome.truncated {
            warn!("mapping record cap reached; result truncated");
            self.truncated = true;
        }
    }

    /// Runs one scan over `[next, next + quantum)`, or, with a
    /// worker pool, over all of `[next, end)` partitioned across
    /// the workers. Results merge in range order.
    ///
    fn scan_chunk<T, A, F>(
        &mut self,
        next: u64,
        quantum: u64,
        cancel: &CancelToken,
        mut absorb: A,
        scan: F,
    ) -> Result<(u64, bool), DiscoveryError>
    where
        T: Send,
        A: FnMut(&mut Self, Vec<T>),
        F: Fn(&GuestRam, &memory::AddressSpace, u64, u64, &CancelToken) -> Result<Vec<T>, ReadError>
            + Sync,
    {
        let total = self.ctx.ram().total_size();
        let workers = effective_workers(self.ctx.options().workers);

        if workers > 1 {
            // Disjoint ranges, one per worker, merged in range
            // order: ordering guarantees survive the fan-out.
            let ranges = partition(next, total, workers);
            let ram = self.ctx.ram();
            let space = self.ctx.address_space();
            let scan = &scan;

            let results: Vec<Result<Vec<T>, ReadError>> =
                crossbeam::thread::scope(|scope| {
                    let handles: Vec<_> = ranges
                        .iter()
                        .map(|&(start, end)| {
                            scope.spawn(move |_| scan(ram, space, start, end, cancel))
                        })
                        .collect();
                    handles
                        .into_iter()
                        .map(|handle| handle.join().expect("scan worker panicked"))
                        .collect()
                })
                .expect("scan scope panicked");

            for result in results {
                let found = result?;
                absorb(self, found);
            }

            return Ok((total, true));
        }

        let end = (next + quantum).min(total);
        let found = scan(
            self.ctx.ram(),
            self.ctx.address_space(),
            next,
            end,
            cancel,
        )?;
        absorb(self, found);
        Ok((end, end >= total || cancel.is_cancelled()))
    }
}

/// Searches the first `span` bytes for the `Linux version `
/// banner and returns the full banner line.
///
fn find_banner(ram: &GuestRam, span: u64) -> Result<Option<String>, ReadError> {
    const NEEDLE: &[u8] = b"Linux version ";
    const CHUNK: u64 = 1024 * 1024;

    let end = span.min(ram.total_size());
    let mut offset = 0_u64;

    while offset < end {
        let len = (end - offset).min(CHUNK + NEEDLE.len() as u64 - 1);
        let bytes = ram.read_bytes(offset, len)?;

        if let Some(at) = bytes
            .windows(NEEDLE.len())
            .position(|window| window == NEEDLE)
        {
            let banner = ram.read_cstring(offset + at as u64, 200)?;
            let line = banner.lines().next().unwrap_or("").trim_end().to_string();
            return Ok(Some(line));
        }

        offset += CHUNK;
    }

    Ok(None)
}

fn effective_workers(configured: usize) -> usize {
    if configured != 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Splits `[start, end)` into up to `parts` contiguous ranges.
///
fn partition(start: u64, end: u64, parts: usize) -> Vec<(u64, u64)> {
    if start >= end {
        return Vec::new();
    }

    let span = end - start;
    let parts = (parts as u64).min(span.div_ceil(PAGE_SIZE)).max(1);
    let chunk = memory::align_up(span.div_ceil(parts), PAGE_SIZE);

    let mut ranges = Vec::new();
    let mut at = start;
    while at < end {
        let stop = (at + chunk).min(end);
        ranges.push((at, stop));
        at = stop;
    }
    ranges
}
