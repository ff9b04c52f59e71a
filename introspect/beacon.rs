// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Discovery of the optional in-guest companion's beacon pages.
//!
//! A small companion program inside the guest may publish supplementary
//! information through ordinary memory pages it marks itself. From the
//! host they are discoverable with no cooperation at all: any 4 KiB page
//! that begins with the magic `0x3142FACE` and passes a header checksum
//! is a beacon.
//!
//! The 32-byte header is, little-endian and packed:
//!
//! | Offset | Field | Type |
//! | ------ | ----- | ---- |
//! | 0      | magic | `u32` |
//! | 4      | block_type | `u16` |
//! | 6      | block_id | `u16` |
//! | 8      | page_index | `u32` |
//! | 12     | generation | `u32` |
//! | 16     | data_size | `u32` |
//! | 20     | timestamp | `u64` |
//! | 28     | checksum | `u32` |
//!
//! The checksum is the wrapping `u32` sum of the seven 32-bit words
//! formed by the first 28 bytes.
//!
//! The engine consumes two block types: the PID list (a circular buffer
//! of `u32` pids) and the round-robin process block (variable-size
//! entries carrying pid, command name, and a section list). Everything a
//! beacon says is a *hint*, since the guest controls these bytes, and is
//! cross-checked against discovered state before use.

use guestram::{GuestRam, ReadError};
use memory::PAGE_SIZE;

/// The 32-bit little-endian magic marking a beacon page.
///
pub const BEACON_MAGIC: u32 = 0x3142_FACE;

/// The size of a beacon header.
///
pub const HEADER_SIZE: usize = 32;

/// The PID-list block type.
///
pub const BLOCK_PID_LIST: u16 = 1;

/// The round-robin process block type.
///
pub const BLOCK_PROCESSES: u16 = 2;

// The guest controls data_size; cap what we are willing to read.
const MAX_DATA_SIZE: u32 = 1024 * 1024;

// Caps on untrusted element counts.
const MAX_PIDS: usize = 65_536;
const MAX_PROCESSES: usize = 4096;
const MAX_VMAS: usize = 4096;
const MAX_NAME: usize = 256;

/// A parsed and checksum-verified beacon header.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BeaconHeader {
    pub block_type: u16,
    pub block_id: u16,
    pub page_index: u32,
    pub generation: u32,
    pub data_size: u32,
    pub timestamp: u64,
}

impl BeaconHeader {
    /// Parses a beacon header from the start of a page, verifying
    /// the magic and the checksum.
    ///
    pub fn parse(bytes: &[u8]) -> Option<BeaconHeader> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }

        let word = |at: usize| {
            let mut buf = [0_u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(buf)
        };

        if word(0) != BEACON_MAGIC {
            return None;
        }

        let mut sum = 0_u32;
        for at in (0..28).step_by(4) {
            sum = sum.wrapping_add(word(at));
        }
        if sum != word(28) {
            return None;
        }

        let mut timestamp = [0_u8; 8];
        timestamp.copy_from_slice(&bytes[20..28]);

        Some(BeaconHeader {
            block_type: u16::from_le_bytes([bytes[4], bytes[5]]),
            block_id: u16::from_le_bytes([bytes[6], bytes[7]]),
            page_index: word(8),
            generation: word(12),
            data_size: word(16),
            timestamp: u64::from_le_bytes(timestamp),
        })
    }

    /// Computes the checksum for a header's first 28 bytes.
    ///
    pub fn checksum(bytes: &[u8; 28]) -> u32 {
        let mut sum = 0_u32;
        for at in (0..28).step_by(4) {
            let mut buf = [0_u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            sum = sum.wrapping_add(u32::from_le_bytes(buf));
        }
        sum
    }
}

/// One section as the companion reports it.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BeaconVma {
    pub start: u64,
    pub end: u64,
    pub prot: u32,
    pub kind: u32,
    pub name: Option<String>,
}

/// One process entry from a round-robin block.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub comm: String,
    pub vmas: Vec<BeaconVma>,
}

/// A parsed beacon block payload.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BeaconBlock {
    /// The circular pid buffer, in chronological order.
    PidList(Vec<u32>),

    /// Round-robin process entries.
    Processes(Vec<ProcessRecord>),

    /// A block type the engine does not consume.
    Other(u16),
}

/// Scans a file-offset range for beacon pages, returning each
/// verified header with its file offset.
///
/// Only 4 KiB-aligned page starts are considered. The range's
/// start is rounded up to a page boundary.
///
pub fn scan_range(
    ram: &GuestRam,
    start: u64,
    end: u64,
) -> Result<Vec<(u64, BeaconHeader)>, ReadError> {
    let mut found = Vec::new();
    let end = end.min(ram.total_size());

    let mut offset = memory::align_up(start, PAGE_SIZE);
    while offset + PAGE_SIZE <= end {
        let window = ram.window_at(offset)?;
        let within = (offset - window.base_offset()) as usize;
        let window_end = window.len() - window.len() % PAGE_SIZE as usize;

        for page in (within..window_end).step_by(PAGE_SIZE as usize) {
            let absolute = window.base_offset() + page as u64;
            if absolute + PAGE_SIZE > end {
                break;
            }

            // Cheap pre-check on the magic before parsing.
            if window[page..page + 4] != BEACON_MAGIC.to_le_bytes() {
                continue;
            }
            if let Some(header) = BeaconHeader::parse(&window[page..page + HEADER_SIZE]) {
                found.push((absolute, header));
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

/// Reads and parses the payload of a beacon block found at
/// `offset`.
///
pub fn read_block(
    ram: &GuestRam,
    offset: u64,
    header: &BeaconHeader,
) -> Result<BeaconBlock, ReadError> {
    let data_size = header.data_size.min(MAX_DATA_SIZE) as u64;
    let available = ram.total_size().saturating_sub(offset + HEADER_SIZE as u64);
    let payload = ram.read_bytes(offset + HEADER_SIZE as u64, data_size.min(available))?;

    Ok(match header.block_type {
        BLOCK_PID_LIST => BeaconBlock::PidList(parse_pid_list(&payload)),
        BLOCK_PROCESSES => BeaconBlock::Processes(parse_processes(&payload)),
        other => BeaconBlock::Other(other),
    })
}

/// Parses a PID-list payload: `count: u32`, `head: u32`, then a
/// ring of pid slots filling the rest of the payload.
///
/// Returns the `min(count, capacity)` most recent pids in
/// chronological order.
///
fn parse_pid_list(payload: &[u8]) -> Vec<u32> {
    let mut reader = Reader::new(payload);
    let count = match reader.u32() {
        Some(count) => count as usize,
        None => return Vec::new(),
    };
    let head = match reader.u32() {
        Some(head) => head as usize,
        None => return Vec::new(),
    };

    let capacity = reader.remaining() / 4;
    if capacity == 0 {
        return Vec::new();
    }

    let slots: Vec<u32> = (0..capacity).filter_map(|_| reader.u32()).collect();
    let n = count.min(capacity).min(MAX_PIDS);
    let head = head % capacity;

    // The writer stores at `head` and increments, so the n most
    // recent entries end just before `head`.
    let mut pids = Vec::with_capacity(n);
    for back in (1..=n).rev() {
        pids.push(slots[(head + capacity - back) % capacity]);
    }
    pids
}

/// Parses a round-robin process payload.
///
fn parse_processes(payload: &[u8]) -> Vec<ProcessRecord> {
    let mut reader = Reader::new(payload);
    let mut processes = Vec::new();

    while processes.len() < MAX_PROCESSES {
        let pid = match reader.u32() {
            Some(pid) if pid != 0 => pid,
            _ => break,
        };
        let comm = match reader.bytes(16) {
            Some(bytes) => {
                let nul = bytes.iter().position(|&b| b == 0).unwrap_or(16);
                String::from_utf8_lossy(&bytes[..nul]).into_owned()
            }
            None => break,
        };
        let vma_count = match reader.u32() {
            Some(count) => (count as usize).min(MAX_VMAS),
            None => break,
        };

        let mut vmas = Vec::with_capacity(vma_count);
        for _ in 0..vma_count {
            let (start, end) = match (reader.u64(), reader.u64()) {
                (Some(start), Some(end)) => (start, end),
                _ => break,
            };
            let (prot, kind) = match (reader.u32(), reader.u32()) {
                (Some(prot), Some(kind)) => (prot, kind),
                _ => break,
            };
            let name_len = match reader.u32() {
                Some(len) => (len as usize).min(MAX_NAME),
                None => break,
            };
            let name = match reader.bytes(name_len) {
                Some(bytes) if !bytes.is_empty() => {
                    Some(String::from_utf8_lossy(bytes).into_owned())
                }
                Some(_) => None,
                None => break,
            };

            vmas.push(BeaconVma {
                start,
                end,
                prot,
                kind,
                name,
            });
        }

        processes.push(ProcessRecord { pid, comm, vmas });
    }

    processes
}

/// A bounds-checked little-endian cursor over untrusted bytes.
///
struct Reader<'buf> {
    bytes: &'buf [u8],
    at: usize,
}

impl<'buf> Reader<'buf> {
    fn new(bytes: &'buf [u8]) -> Self {
        Reader { bytes, at: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.at
    }

    fn bytes(&mut self, n: usize) -> Option<&'buf [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.bytes[self.at..self.at + n];
        self.at += n;
        Some(slice)
    }

    fn u32(&mut self) -> Option<u32> {
        self.bytes(4).map(|b| {
            let mut buf = [0_u8; 4];
            buf.copy_from_slice(b);
            u32::from_le_bytes(buf)
        })
    }

    fn u64(&mut self) -> Option<u64> {
        self.bytes(8).map(|b| {
            let mut buf = [0_u8; 8];
            buf.copy_from_slice(b);
            u64::from_le_bytes(buf)
        })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::{parse_pid_list, parse_processes, BeaconHeader, BEACON_MAGIC, BLOCK_PID_LIST, HEADER_SIZE};

    /// Builds a beacon page: a valid header followed by the
    /// payload, padded to 4 KiB.
    ///
    pub(crate) fn beacon_page(block_type: u16, block_id: u16, payload: &[u8]) -> Vec<u8> {
        let mut head = Vec::with_capacity(28);
        head.extend_from_slice(&BEACON_MAGIC.to_le_bytes());
        head.extend_from_slice(&block_type.to_le_bytes());
        head.extend_from_slice(&block_id.to_le_bytes());
        head.extend_from_slice(&0_u32.to_le_bytes()); // page_index
        head.extend_from_slice(&1_u32.to_le_bytes()); // generation
        head.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        head.extend_from_slice(&7_u64.to_le_bytes()); // timestamp

        let mut fixed = [0_u8; 28];
        fixed.copy_from_slice(&head);
        let checksum = BeaconHeader::checksum(&fixed);

        let mut page = head;
        page.extend_from_slice(&checksum.to_le_bytes());
        page.extend_from_slice(payload);
        page.resize(4096.max(HEADER_SIZE + payload.len()), 0);
        page
    }

    #[test]
    fn test_header_round_trip() {
        let page = beacon_page(BLOCK_PID_LIST, 3, &[0_u8; 64]);
        let header = BeaconHeader::parse(&page).unwrap();
        assert_eq!(header.block_type, BLOCK_PID_LIST);
        assert_eq!(header.block_id, 3);
        assert_eq!(header.data_size, 64);
        assert_eq!(header.timestamp, 7);

        // A corrupted byte fails the checksum.
        let mut bad = page.clone();
        bad[9] ^= 0xff;
        assert_eq!(BeaconHeader::parse(&bad), None);

        // The wrong magic never parses.
        let mut bad = page;
        bad[0] ^= 0x01;
        assert_eq!(BeaconHeader::parse(&bad), None);
    }

    #[test]
    fn test_pid_list() {
        // A ring of 4 slots holding 6 writes: slots hold the last
        // four pids, head points past the most recent.
        let mut payload = Vec::new();
        payload.extend_from_slice(&6_u32.to_le_bytes()); // count
        payload.extend_from_slice(&2_u32.to_le_bytes()); // head
        for pid in [104_u32, 105, 102, 103] {
            payload.extend_from_slice(&pid.to_le_bytes());
        }

        // Most recent four, chronological: 102, 103, 104, 105.
        assert_eq!(parse_pid_list(&payload), vec![102, 103, 104, 105]);

        // A short payload yields nothing rather than failing.
        assert_eq!(parse_pid_list(&payload[..6]), Vec::<u32>::new());
    }

    #[test]
    fn test_processes() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&42_u32.to_le_bytes());
        let mut comm = [0_u8; 16];
        comm[..4].copy_from_slice(b"sshd");
        payload.extend_from_slice(&comm);
        payload.extend_from_slice(&2_u32.to_le_bytes()); // vma_count
        for (start, end, prot, kind, name) in [
            (0xaaaa_0000_0000_u64, 0xaaaa_0000_4000_u64, 0b101_u32, 1_u32, &b"/usr/sbin/sshd"[..]),
            (0xffff_f000_0000, 0xffff_f002_0000, 0b011, 4, &b""[..]),
        ] {
            payload.extend_from_slice(&start.to_le_bytes());
            payload.extend_from_slice(&end.to_le_bytes());
            payload.extend_from_slice(&prot.to_le_bytes());
            payload.extend_from_slice(&kind.to_le_bytes());
            payload.extend_from_slice(&(name.len() as u32).to_le_bytes());
            payload.extend_from_slice(name);
        }
        // pid 0 terminates the list.
        payload.extend_from_slice(&0_u32.to_le_bytes());

        let processes = parse_processes(&payload);
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].pid, 42);
        assert_eq!(processes[0].comm, "sshd");
        assert_eq!(processes[0].vmas.len(), 2);
        assert_eq!(processes[0].vmas[0].name.as_deref(), Some("/usr/sbin/sshd"));
        assert_eq!(processes[0].vmas[1].name, None);
        assert_eq!(processes[0].vmas[1].kind, 4);
    }
}
