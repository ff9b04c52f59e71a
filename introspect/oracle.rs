// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The optional management-channel oracle.
//!
//! Some hypervisors expose a request/response channel that can report a
//! virtual CPU's translation registers. When available, discovery uses it
//! for one thing only: reading `TTBR1_EL1` to skip the kernel-PGD scan.
//! The oracle's absence, or any failure it reports, never blocks
//! discovery; the scan runs instead.

use core::fmt;

/// A virtual CPU's translation state, as reported by the oracle.
///
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct KernelInfo {
    /// The user-half translation-table root register.
    pub ttbr0: u64,

    /// The kernel-half translation-table root register. Bits
    /// 47..12 carry the table address; the surrounding ASID and
    /// CnP bits must be masked off before use.
    pub ttbr1: u64,

    /// The translation-control register.
    pub tcr: u64,
}

/// A failed oracle query.
///
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// The channel is not present or not responding.
    #[error("management channel unavailable")]
    Unavailable,

    /// The channel answered with something unusable.
    #[error("management channel protocol error: {0}")]
    Protocol(String),
}

/// A source of ground truth about a virtual CPU's translation
/// registers.
///
/// Implementations wrap whatever management channel the
/// hypervisor provides. Discovery holds the oracle behind a
/// `Context` and tolerates every failure.
///
pub trait KernelOracle: Send + Sync {
    /// Reads the translation registers of the given virtual CPU.
    ///
    fn query_kernel_info(&self, cpu: u32) -> Result<KernelInfo, OracleError>;
}

impl fmt::Debug for dyn KernelOracle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("dyn KernelOracle")
    }
}
