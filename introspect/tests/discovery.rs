// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! End-to-end discovery over a synthetic guest RAM image.
//!
//! The image is a 32 MiB file laid out like a small ARM64 guest: a
//! kernel version banner, a sparse `swapper_pg_dir` whose PUD/PMD
//! tables linearly map all of RAM in 2 MiB blocks, a circular list of
//! `task_struct`s shaped per the built-in 6.1 profile, two user
//! translation hierarchies sharing one physical page, a file-table
//! chain, and a pair of companion beacon pages. Nothing is labelled:
//! discovery has to find all of it the same way it would in a real
//! image.

use introspect::{
    BeaconHeader, CancelToken, Context, DiscoveryOptions, KernelInfo, KernelOracle,
    KernelProfile, KernelProfiles, OracleError, BEACON_MAGIC,
};
use memory::{AddressSpace, PhysAddr, VirtAddr};
use pagewalk::Walker;
use pretty_assertions::assert_eq;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

const BASE: u64 = 0x4000_0000;
const LINEAR: u64 = 0xffff_0000_0000_0000;
const SIZE: usize = 32 * 1024 * 1024;

// File offsets of everything in the image.
const BANNER: u64 = 0x1_0000;
const SWAPPER: u64 = 0x10_0000;
const KERNEL_PUD: u64 = 0x10_1000;
const KERNEL_PMD: u64 = 0x10_2000;
const EMPTY_256: u64 = 0x10_4000;
const EMPTY_507: u64 = 0x10_5000;
const EMPTY_511: u64 = 0x10_6000;
const TASK_INIT: u64 = 0x20_0000;
const TASK_KTHREADD: u64 = 0x20_4000;
const TASK_SSHD: u64 = 0x20_8000;
const TASK_BROKEN: u64 = 0x20_c000;
const TASK_FAKE: u64 = 0x25_0000;
const MM_INIT: u64 = 0x21_0000;
const MM_SSHD: u64 = 0x21_1000;
const PGD_INIT: u64 = 0x22_0000;
const PGD_SSHD: u64 = 0x22_4000;
const FILES_INIT: u64 = 0x23_0000;
const FDT_INIT: u64 = 0x23_1000;
const FDARR_INIT: u64 = 0x23_2000;
const FILE_INIT: u64 = 0x23_3000;
const INODE_INIT: u64 = 0x23_4000;
const BEACON_PROCESSES: u64 = 0x24_0000;
const BEACON_PIDS: u64 = 0x24_1000;
const DATA_INIT: u64 = 0x30_0000;
const SHARED_PAGE: u64 = 0x30_1000;
const CODE_INIT: u64 = 0x30_2000;
const DATA_SSHD: u64 = 0x30_3000;

// Descriptor building blocks.
const TABLE: u64 = 0b11;
const BLOCK: u64 = 0b01;
const PAGE: u64 = 0b11;
const ACCESS: u64 = 1 << 10;
const EL0: u64 = 1 << 6;
const WRITE: u64 = 1 << 51;
const UXN: u64 = 1 << 54;

fn kernel_va(offset: u64) -> u64 {
    LINEAR + offset
}

struct Image {
    bytes: Vec<u8>,
    profile: KernelProfile,
}

impl Image {
    fn new() -> Self {
        let profile = KernelProfiles::builtin()
            .select(Some("Linux version 6.1.55"))
            .clone();
        Image {
            bytes: vec![0; SIZE],
            profile,
        }
    }

    fn put(&mut self, offset: u64, data: &[u8]) {
        let at = offset as usize;
        self.bytes[at..at + data.len()].copy_from_slice(data);
    }

    fn u32(&mut self, offset: u64, value: u32) {
        self.put(offset, &value.to_le_bytes());
    }

    fn u64(&mut self, offset: u64, value: u64) {
        self.put(offset, &value.to_le_bytes());
    }

    fn descriptor(&mut self, table: u64, index: u64, value: u64) {
        self.u64(table + index * 8, value);
    }

    fn task(
        &mut self,
        offset: u64,
        pid: u32,
        comm: &str,
        tasks_next: u64,
        tasks_prev: u64,
        mm: u64,
        files: u64,
    ) {
        let task = self.profile.task;
        self.u32(offset + task.pid as u64, pid);
        self.u32(offset + task.tgid as u64, pid);
        let mut name = [0_u8; 16];
        name[..comm.len()].copy_from_slice(comm.as_bytes());
        self.put(offset + task.comm as u64, &name);
        self.u64(offset + task.tasks as u64, tasks_next);
        self.u64(offset + task.tasks as u64 + 8, tasks_prev);
        self.u64(offset + task.mm as u64, mm);
        self.u64(offset + task.files as u64, files);
    }

    fn beacon(&mut self, offset: u64, block_type: u16, payload: &[u8]) {
        let mut head = Vec::with_capacity(28);
        head.extend_from_slice(&BEACON_MAGIC.to_le_bytes());
        head.extend_from_slice(&block_type.to_le_bytes());
        head.extend_from_slice(&1_u16.to_le_bytes()); // block_id
        head.extend_from_slice(&0_u32.to_le_bytes()); // page_index
        head.extend_from_slice(&1_u32.to_le_bytes()); // generation
        head.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        head.extend_from_slice(&99_u64.to_le_bytes()); // timestamp

        let mut fixed = [0_u8; 28];
        fixed.copy_from_slice(&head);
        head.extend_from_slice(&BeaconHeader::checksum(&fixed).to_le_bytes());
        head.extend_from_slice(payload);
        self.put(offset, &head);
    }

    /// Builds the standard image every test starts from.
    ///
    fn standard() -> Self {
        let mut image = Image::new();
        let task_offset = image.profile.task.tasks as u64;

        image.put(
            BANNER,
            b"Linux version 6.1.55-haywire (gcc 12.2.0) #1 SMP\0",
        );

        // The kernel PGD: sparse, with a linear map under entry 0
        // and decoy kernel entries for the scorer to like.
        image.descriptor(SWAPPER, 0, (BASE + KERNEL_PUD) | TABLE);
        image.descriptor(SWAPPER, 256, (BASE + EMPTY_256) | TABLE);
        image.descriptor(SWAPPER, 507, (BASE + EMPTY_507) | TABLE);
        image.descriptor(SWAPPER, 511, (BASE + EMPTY_511) | TABLE);
        image.descriptor(KERNEL_PUD, 0, (BASE + KERNEL_PMD) | TABLE);
        for index in 0..16 {
            image.descriptor(
                KERNEL_PMD,
                index,
                (BASE + index * 0x20_0000) | BLOCK | ACCESS | WRITE,
            );
        }

        // The circular task list: init → kthreadd → sshd → broken
        // and back around.
        image.task(
            TASK_INIT,
            1,
            "init",
            kernel_va(TASK_KTHREADD + task_offset),
            kernel_va(TASK_BROKEN + task_offset),
            kernel_va(MM_INIT),
            kernel_va(FILES_INIT),
        );
        image.task(
            TASK_KTHREADD,
            2,
            "kthreadd",
            kernel_va(TASK_SSHD + task_offset),
            kernel_va(TASK_INIT + task_offset),
            0,
            0,
        );
        image.task(
            TASK_SSHD,
            100,
            "sshd",
            kernel_va(TASK_BROKEN + task_offset),
            kernel_va(TASK_KTHREADD + task_offset),
            kernel_va(MM_SSHD),
            0,
        );

        // A task whose mm points at an unmapped kernel address, as
        // happens when a task_struct straddles pages that are not
        // physically contiguous: it stays in the list but resolves
        // no page tables.
        image.task(
            TASK_BROKEN,
            50,
            "broken",
            kernel_va(TASK_INIT + task_offset),
            kernel_va(TASK_SSHD + task_offset),
            kernel_va(0x3f0_0000),
            0,
        );

        // A decoy that passes the signature but is on no list.
        image.task(
            TASK_FAKE,
            7777,
            "notatask",
            kernel_va(0x26_0000),
            kernel_va(0x26_0100),
            0,
            0,
        );

        // mm_structs pointing at the user translation roots.
        let pgd_field = image.profile.mm.pgd as u64;
        image.u64(MM_INIT + pgd_field, kernel_va(PGD_INIT));
        image.u64(MM_SSHD + pgd_field, kernel_va(PGD_SSHD));

        // init's address space: two data pages and a code page.
        image.descriptor(PGD_INIT, 0, (BASE + PGD_INIT + 0x1000) | TABLE);
        image.descriptor(PGD_INIT + 0x1000, 0, (BASE + PGD_INIT + 0x2000) | TABLE);
        image.descriptor(PGD_INIT + 0x2000, 0, (BASE + PGD_INIT + 0x3000) | TABLE);
        let rw = PAGE | ACCESS | EL0 | WRITE | UXN;
        let rx = PAGE | ACCESS | EL0;
        image.descriptor(PGD_INIT + 0x3000, 1, (BASE + DATA_INIT) | rw);
        image.descriptor(PGD_INIT + 0x3000, 2, (BASE + SHARED_PAGE) | rw);
        image.descriptor(PGD_INIT + 0x3000, 3, (BASE + CODE_INIT) | rx);

        // sshd's address space shares one physical page with init.
        image.descriptor(PGD_SSHD, 0, (BASE + PGD_SSHD + 0x1000) | TABLE);
        image.descriptor(PGD_SSHD + 0x1000, 0, (BASE + PGD_SSHD + 0x2000) | TABLE);
        image.descriptor(PGD_SSHD + 0x2000, 0, (BASE + PGD_SSHD + 0x3000) | TABLE);
        image.descriptor(PGD_SSHD + 0x3000, 1, (BASE + SHARED_PAGE) | rw);
        image.descriptor(PGD_SSHD + 0x3000, 4, (BASE + DATA_SSHD) | rw);

        // init's file table: one open descriptor, fd 1.
        image.u64(
            FILES_INIT + image.profile.files.fdt as u64,
            kernel_va(FDT_INIT),
        );
        image.u32(FDT_INIT + image.profile.fdt.max_fds as u64, 4);
        image.u64(FDT_INIT + image.profile.fdt.fd as u64, kernel_va(FDARR_INIT));
        image.u64(FDARR_INIT + 8, kernel_va(FILE_INIT));
        image.u64(
            FILE_INIT + image.profile.file.inode as u64,
            kernel_va(INODE_INIT),
        );
        image.u32(INODE_INIT + image.profile.inode.mode as u64, 0o100644);
        image.u64(INODE_INIT + image.profile.inode.ino as u64, 42);
        image.u64(INODE_INIT + image.profile.inode.size as u64, 1234);

        // Companion beacons: a round-robin block describing sshd,
        // and a pid-list block.
        let mut processes = Vec::new();
        processes.extend_from_slice(&100_u32.to_le_bytes());
        let mut comm = [0_u8; 16];
        comm[..4].copy_from_slice(b"sshd");
        processes.extend_from_slice(&comm);
        processes.extend_from_slice(&2_u32.to_le_bytes());
        for (start, end, prot, kind, name) in [
            (0x1000_u64, 0x2000_u64, 0b011_u32, 4_u32, &b"[stack]"[..]),
            (0x4000, 0x5000, 0b011, 0, &b""[..]),
        ] {
            processes.extend_from_slice(&start.to_le_bytes());
            processes.extend_from_slice(&end.to_le_bytes());
            processes.extend_from_slice(&prot.to_le_bytes());
            processes.extend_from_slice(&kind.to_le_bytes());
            processes.extend_from_slice(&(name.len() as u32).to_le_bytes());
            processes.extend_from_slice(name);
        }
        processes.extend_from_slice(&0_u32.to_le_bytes());
        image.beacon(BEACON_PROCESSES, 2, &processes);

        let mut pids = Vec::new();
        pids.extend_from_slice(&2_u32.to_le_bytes()); // count
        pids.extend_from_slice(&0_u32.to_le_bytes()); // head
        pids.extend_from_slice(&1_u32.to_le_bytes());
        pids.extend_from_slice(&100_u32.to_le_bytes());
        image.beacon(BEACON_PIDS, 1, &pids);

        // Page contents: init's private data page is not zero; the
        // shared page stays all-zero.
        image.put(DATA_INIT, b"not a zero page");

        image
    }

    fn build(self) -> (NamedTempFile, KernelProfile) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&self.bytes).unwrap();
        file.flush().unwrap();
        (file, self.profile)
    }
}

fn context(file: &NamedTempFile, options: DiscoveryOptions) -> Context {
    let ram = Arc::new(guestram::GuestRam::open(file.path()).unwrap());
    let space = AddressSpace::new(BASE, SIZE as u64, LINEAR).unwrap();
    Context::new(ram, space, KernelProfiles::builtin(), options)
}

#[test]
fn test_full_discovery() {
    let (file, _) = Image::standard().build();
    let ctx = context(&file, DiscoveryOptions::default());

    let discovery = introspect::discover(&ctx, &CancelToken::new()).unwrap();

    // The kernel PGD was found by scan and survived validation.
    assert_eq!(discovery.swapper_pgd, Some(PhysAddr::new(BASE + SWAPPER)));
    assert!(discovery.stats.pgd_validated);
    assert!(!discovery.stats.pgd_from_oracle);
    assert_eq!(discovery.stats.pgd_score, 8);
    assert!(!discovery.cancelled);
    assert!(!discovery.truncated);

    // The version banner selected the 6.1 profile.
    assert!(discovery
        .stats
        .kernel_version
        .as_deref()
        .unwrap()
        .contains("6.1.55-haywire"));
    assert_eq!(discovery.stats.profile_version, "6.1");

    // Four real tasks, in ascending file-offset order; the decoy
    // failed list cross-validation.
    let pids: Vec<u32> = discovery.processes.iter().map(|p| p.pid).collect();
    assert_eq!(pids, vec![1, 2, 100, 50]);
    assert!(discovery.stats.tasks_rejected >= 1);
    assert!(discovery.process(7777).is_none());

    let init = discovery.process(1).unwrap();
    let kthreadd = discovery.process(2).unwrap();
    let sshd = discovery.process(100).unwrap();

    assert_eq!(init.comm, "init");
    assert_eq!(init.user_pgd, Some(PhysAddr::new(BASE + PGD_INIT)));
    assert!(!init.is_kernel_thread);

    assert!(kthreadd.is_kernel_thread);
    assert_eq!(kthreadd.mm_pa, None);
    assert!(kthreadd.ptes.is_empty());

    // init's mappings, in table order, with decoded permissions.
    let mappings: Vec<(u64, u64, String)> = init
        .ptes
        .iter()
        .map(|r| (r.va.as_u64(), r.pa.as_u64(), r.protection.to_string()))
        .collect();
    assert_eq!(
        mappings,
        vec![
            (0x1000, BASE + DATA_INIT, "rw-".to_string()),
            (0x2000, BASE + SHARED_PAGE, "rw-".to_string()),
            (0x3000, BASE + CODE_INIT, "r-x".to_string()),
        ]
    );

    // Re-translating every record reproduces its physical address.
    let walker = Walker::new(ctx.ram().clone(), *ctx.address_space());
    for process in &discovery.processes {
        let pgd = match process.user_pgd {
            Some(pgd) => pgd,
            None => continue,
        };
        for record in &process.ptes {
            let translation = walker.translate(record.va, pgd).unwrap();
            assert_eq!(translation.pa, record.pa);
            assert_eq!(translation.protection, record.protection);
        }
    }

    // The kernel's linear map came out as 16 2 MiB blocks.
    assert_eq!(discovery.kernel_ptes.len(), 16);
    assert!(discovery.kernel_ptes.iter().all(|r| r.pid == 0));
    assert_eq!(
        discovery.kernel_ptes[0].va,
        VirtAddr::new(0xffff_0000_0000_0000)
    );

    // The shared page: two distinct pids, verified all-zero.
    let shared = discovery
        .page_info(PhysAddr::new(BASE + SHARED_PAGE))
        .unwrap();
    assert!(shared.is_shared());
    assert!(shared.is_zero());
    assert_eq!(
        shared.distinct_pids().into_iter().collect::<Vec<_>>(),
        vec![1, 100]
    );
    assert!(!discovery
        .page_info(PhysAddr::new(BASE + DATA_INIT))
        .unwrap()
        .is_zero());

    let shared_list: Vec<(PhysAddr, Vec<u32>)> = discovery.shared_pages().collect();
    assert!(shared_list
        .iter()
        .any(|(pa, pids)| *pa == PhysAddr::new(BASE + SHARED_PAGE) && pids == &vec![1, 100]));

    // Every non-kernel reference belongs to a discovered process.
    for entry in discovery.pages.pages() {
        for reference in entry.references() {
            assert!(
                reference.pid == 0 || discovery.process(reference.pid).is_some(),
                "orphan reference from pid {}",
                reference.pid
            );
        }
    }

    // sshd's sections came from the beacon; init's were
    // synthesised from its mappings.
    assert!(discovery.stats.beacon_pages >= 2);
    assert_eq!(discovery.stats.beacon_pids, 2);
    assert_eq!(sshd.sections[0].kind, pagedb::SectionKind::Stack);
    assert!(init
        .sections
        .iter()
        .any(|s| s.kind == pagedb::SectionKind::Code));

    // The tooltip for the shared page names both processes.
    let tip = discovery.pages.tooltip(PhysAddr::new(BASE + SHARED_PAGE));
    assert!(tip.contains("shared by 2 processes"), "tooltip: {tip}");
    assert!(tip.contains("pid 1 (init)"), "tooltip: {tip}");
    assert!(tip.contains("pid 100 (sshd)"), "tooltip: {tip}");

    // init's open file came through the fdtable chain.
    assert_eq!(init.open_files.len(), 1);
    assert_eq!(init.open_files[0].fd, 1);
    assert_eq!(init.open_files[0].ino, 42);
    assert_eq!(init.open_files[0].size, 1234);
    assert_eq!(init.open_files[0].mode, 0o100644);

    // The broken task stays listed but contributes no mappings.
    let broken = discovery.process(50).unwrap();
    assert!(broken.pagetable_unresolved);
    assert_eq!(broken.user_pgd, None);
    assert!(broken.ptes.is_empty());

    // Two of the three tasks with an mm resolved.
    assert!((discovery.stats.completeness - 2.0 / 3.0).abs() < 1e-6);
    assert_eq!(discovery.stats.pagetable_unresolved, 1);
    assert_eq!(discovery.stats.kernel_threads, 1);
}

#[test]
fn test_discovery_is_idempotent() {
    let (file, _) = Image::standard().build();
    let ctx = context(&file, DiscoveryOptions::default());

    let first = introspect::discover(&ctx, &CancelToken::new()).unwrap();
    let second = introspect::discover(&ctx, &CancelToken::new()).unwrap();

    let summarise = |d: &introspect::Discovery| {
        d.processes
            .iter()
            .map(|p| (p.pid, p.comm.clone(), p.user_pgd, p.ptes.len()))
            .collect::<Vec<_>>()
    };

    assert_eq!(summarise(&first), summarise(&second));
    assert_eq!(first.swapper_pgd, second.swapper_pgd);
    assert_eq!(first.pages.statistics(), second.pages.statistics());
}

#[test]
fn test_record_cap_truncates() {
    let (file, _) = Image::standard().build();
    let options = DiscoveryOptions {
        max_pte_records: 5,
        ..DiscoveryOptions::default()
    };
    let ctx = context(&file, options);

    let discovery = introspect::discover(&ctx, &CancelToken::new()).unwrap();

    assert!(discovery.truncated);
    assert_eq!(discovery.stats.pte_records, 5);
    assert_eq!(discovery.kernel_ptes.len(), 5);

    // Truncation is not an error: the process list is intact.
    let pids: Vec<u32> = discovery.processes.iter().map(|p| p.pid).collect();
    assert_eq!(pids, vec![1, 2, 100, 50]);
}

#[test]
fn test_cancellation_returns_partial_result() {
    let (file, _) = Image::standard().build();
    let ctx = context(&file, DiscoveryOptions::default());

    let cancel = CancelToken::new();
    cancel.cancel();

    let discovery = introspect::discover(&ctx, &cancel).unwrap();
    assert!(discovery.cancelled);
    assert!(discovery.processes.is_empty());
    assert!(discovery.pages.is_frozen());
}

#[test]
fn test_oracle_short_circuits_pgd_scan() {
    struct FixedOracle(u64);

    impl KernelOracle for FixedOracle {
        fn query_kernel_info(&self, _cpu: u32) -> Result<KernelInfo, OracleError> {
            Ok(KernelInfo {
                ttbr0: 0,
                ttbr1: self.0,
                tcr: 0,
            })
        }
    }

    let (file, _) = Image::standard().build();
    // The register carries an ASID and the CnP bit around the
    // table address; both must be masked away.
    let ttbr1 = (0x2a_u64 << 48) | (BASE + SWAPPER) | 1;
    let ctx = context(&file, DiscoveryOptions::default())
        .with_oracle(Box::new(FixedOracle(ttbr1)));

    let discovery = introspect::discover(&ctx, &CancelToken::new()).unwrap();

    assert_eq!(discovery.swapper_pgd, Some(PhysAddr::new(BASE + SWAPPER)));
    assert!(discovery.stats.pgd_from_oracle);
    assert!(discovery.stats.pgd_validated);
    assert_eq!(discovery.stats.pgd_candidates, 0);

    let pids: Vec<u32> = discovery.processes.iter().map(|p| p.pid).collect();
    assert_eq!(pids, vec![1, 2, 100, 50]);
}

#[test]
fn test_empty_image_yields_partial_result() {
    // An image with nothing in it: discovery finds nothing and
    // reports that, without erroring.
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&vec![0_u8; 4 * 1024 * 1024]).unwrap();
    file.flush().unwrap();

    let ram = Arc::new(guestram::GuestRam::open(file.path()).unwrap());
    let space = AddressSpace::new(BASE, 4 * 1024 * 1024, LINEAR).unwrap();
    let ctx = Context::new(
        ram,
        space,
        KernelProfiles::builtin(),
        DiscoveryOptions::default(),
    );

    let discovery = introspect::discover(&ctx, &CancelToken::new()).unwrap();
    assert_eq!(discovery.swapper_pgd, None);
    assert!(discovery.processes.is_empty());
    assert_eq!(discovery.stats.task_raw_hits, 0);
    assert_eq!(discovery.pages.statistics().total_pages, 0);
    assert!(!discovery.cancelled);
}

#[test]
fn test_step_driver_reports_phases() {
    let (file, _) = Image::standard().build();
    let options = DiscoveryOptions {
        workers: 1,
        step_quantum: 8 * 1024 * 1024,
        ..DiscoveryOptions::default()
    };
    let ctx = context(&file, options);

    let mut phases = Vec::new();
    let discovery = introspect::DiscoveryDriver::new(&ctx)
        .run_with_progress(&CancelToken::new(), |progress| {
            if phases.last() != Some(&progress.phase) {
                phases.push(progress.phase);
            }
        })
        .unwrap();

    assert_eq!(
        phases,
        vec![
            "orient",
            "scan-pgd",
            "probe-offsets",
            "scan-tasks",
            "select-pgd",
            "resolve-tables",
            "scan-beacon",
            "read-beacons",
            "walk-kernel",
            "walk-processes",
            "sections",
            "open-files",
            "freeze",
        ]
    );
    assert_eq!(discovery.swapper_pgd, Some(PhysAddr::new(BASE + SWAPPER)));
}
