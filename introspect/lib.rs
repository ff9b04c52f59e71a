// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Reconstructs the guest kernel's state from its physical memory alone.
//!
//! The hypervisor exposes a running virtual machine's RAM as a file; this
//! crate reads that file and rebuilds, without any cooperation from the
//! guest kernel, the set of running processes, each process's
//! virtual-to-physical page mappings, and a reverse index from every
//! physical page to everything that references it.
//!
//! Nothing in the file is labelled. KASLR moves the kernel's layout on
//! every boot and KPTI splits what would be one master page table into
//! hundreds of per-process hierarchies, so everything here is pattern
//! matching and pointer chasing:
//!
//! 1. Find `swapper_pg_dir`, the kernel's own translation-table root,
//!    by scoring every page in RAM as a candidate and validating the
//!    best against addresses the kernel demonstrably dereferences.
//! 2. Find `task_struct`s by SLAB-aware signature search, cross-validated
//!    through their circular task-list pointers.
//! 3. Resolve each process's `mm_struct` and user-mode translation root.
//! 4. Enumerate memory sections, from an optional in-guest companion's
//!    beacon pages where present, synthesised from mapping clusters
//!    otherwise.
//! 5. Walk every resolved translation table and build the [`PageDb`]
//!    inverted index.
//!
//! The public surface is small: construct a [`Context`] over a guest RAM
//! file, call [`discover`] (or drive a [`DiscoveryDriver`] by bounded
//! steps), then query the returned [`Discovery`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! let ram = Arc::new(guestram::GuestRam::open("/tmp/guest.ram")?);
//! let space = memory::AddressSpace::new(
//!     memory::DEFAULT_GUEST_RAM_BASE,
//!     ram.total_size(),
//!     memory::DEFAULT_KERNEL_LINEAR_OFFSET,
//! )?;
//! let ctx = introspect::Context::new(
//!     ram,
//!     space,
//!     introspect::KernelProfiles::builtin(),
//!     introspect::DiscoveryOptions::default(),
//! );
//!
//! let discovery = introspect::discover(&ctx, &introspect::CancelToken::new())?;
//! for process in &discovery.processes {
//!     println!("{:>6} {}", process.pid, process.comm);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! The only failure that escapes this crate is an I/O failure of the
//! guest RAM file. Cancellation returns a partial [`Discovery`] flagged
//! `cancelled`, and every recoverable condition becomes a counter in
//! [`DiscoveryStats`].

#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]

mod beacon;
mod discovery;
mod oracle;
mod process;
mod profile;

pub use crate::beacon::{BeaconBlock, BeaconHeader, BeaconVma, ProcessRecord, BEACON_MAGIC};
pub use crate::discovery::{
    discover, Discovery, DiscoveryDriver, DiscoveryError, DiscoveryStats, Progress,
};
pub use crate::oracle::{KernelInfo, KernelOracle, OracleError};
pub use crate::process::{MemorySection, OpenFile, ProcessInfo, PteRecord};
pub use crate::profile::{KernelProfile, KernelProfiles, ProfileError};

use guestram::GuestRam;
use memory::AddressSpace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cooperative cancellation token.
///
/// The discovery driver checks the token at every yield point; a
/// cancelled run returns the partial result assembled so far,
/// flagged `cancelled`.
///
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    ///
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Requests cancellation.
    ///
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns whether cancellation has been requested.
    ///
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Tuning knobs for one discovery pass.
///
/// The defaults suit a multi-gigabyte image; tests shrink them.
///
#[derive(Clone, Debug)]
pub struct DiscoveryOptions {
    /// Upper bound on emitted page-table records across all
    /// processes plus the kernel. Exceeding it truncates the
    /// result rather than failing.
    pub max_pte_records: u64,

    /// Worker threads for the scan phases. Zero means one worker
    /// per available CPU.
    pub workers: usize,

    /// How many bytes of guest RAM a single driver step scans
    /// before yielding.
    pub step_quantum: u64,

    /// How many unshared pages to content-check for zeroes when
    /// the database freezes (shared pages are always checked).
    pub zero_probe_limit: usize,

    /// Upper bound on file descriptors walked per process.
    pub max_open_files: u32,

    /// How far into RAM to look for the `Linux version` banner.
    pub banner_span: u64,

    /// How far into RAM the slab-offset probe pass looks for raw
    /// task-signature hits.
    pub task_probe_span: u64,

    /// How many raw hits the slab-offset probe pass collects
    /// before clustering them.
    pub task_probe_hits: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        DiscoveryOptions {
            max_pte_records: 10_000_000,
            workers: 0,
            step_quantum: 64 * 1024 * 1024,
            zero_probe_limit: 4096,
            max_open_files: 256,
            banner_span: 64 * 1024 * 1024,
            task_probe_span: 256 * 1024 * 1024,
            task_probe_hits: 512,
        }
    }
}

/// Everything one discovery pass needs, owned in one place.
///
/// There is no process-wide state: two contexts over two RAM
/// files coexist without interference.
///
pub struct Context {
    ram: Arc<GuestRam>,
    space: AddressSpace,
    profiles: KernelProfiles,
    options: DiscoveryOptions,
    oracle: Option<Box<dyn KernelOracle>>,
}

impl Context {
    /// Creates a context over an open guest RAM file.
    ///
    pub fn new(
        ram: Arc<GuestRam>,
        space: AddressSpace,
        profiles: KernelProfiles,
        options: DiscoveryOptions,
    ) -> Self {
        Context {
            ram,
            space,
            profiles,
            options,
            oracle: None,
        }
    }

    /// Attaches a management-channel oracle, used solely to
    /// short-circuit the kernel-PGD search. Discovery proceeds
    /// identically without one.
    ///
    #[must_use]
    pub fn with_oracle(mut self, oracle: Box<dyn KernelOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Returns the guest RAM handle.
    ///
    pub fn ram(&self) -> &Arc<GuestRam> {
        &self.ram
    }

    /// Returns the address-space description.
    ///
    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    /// Returns the kernel profile table.
    ///
    pub fn profiles(&self) -> &KernelProfiles {
        &self.profiles
    }

    /// Returns the discovery options.
    ///
    pub fn options(&self) -> &DiscoveryOptions {
        &self.options
    }

    pub(crate) fn oracle(&self) -> Option<&dyn KernelOracle> {
        self.oracle.as_deref()
    }
}
