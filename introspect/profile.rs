// Copyright 2025 The Haywire Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Kernel-version-dependent structure offsets.
//!
//! The fields of `task_struct`, `mm_struct`, and the file tables move
//! between kernel versions and configurations, so every structure read
//! goes through a [`KernelProfile`]: a fixed record of named offsets
//! selected at the start of discovery.
//!
//! Profiles live in a TOML table keyed by a version substring. A built-in
//! table covers common kernels; [`KernelProfiles::from_toml`] loads a
//! replacement at startup. Selection matches the profile's `version`
//! against the `Linux version …` banner found in low guest memory, falling
//! back to the table's first entry when the banner is missing or
//! unmatched.

use serde::Deserialize;

/// The built-in profile table.
///
const BUILTIN_PROFILES: &str = r#"
[[profile]]
version = "6.1"
slab_offsets = [0x0, 0x380, 0x700]

[profile.task]
pid = 0x4e8
tgid = 0x4ec
comm = 0x738
tasks = 0x458
mm = 0x4a0
files = 0x770

[profile.mm]
pgd = 0x68

[profile.files]
fdt = 0x20

[profile.fdt]
max_fds = 0x0
fd = 0x8

[profile.file]
inode = 0x28

[profile.inode]
mode = 0x0
size = 0x50
ino = 0x40

[[profile]]
version = "5.15"
slab_offsets = [0x0, 0x380, 0x700]

[profile.task]
pid = 0x4d8
tgid = 0x4dc
comm = 0x728
tasks = 0x448
mm = 0x490
files = 0x760

[profile.mm]
pgd = 0x68

[profile.files]
fdt = 0x20

[profile.fdt]
max_fds = 0x0
fd = 0x8

[profile.file]
inode = 0x28

[profile.inode]
mode = 0x0
size = 0x50
ino = 0x40
"#;

/// Offsets into `task_struct`.
///
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub struct TaskOffsets {
    pub pid: u32,
    pub tgid: u32,
    pub comm: u32,
    pub tasks: u32,
    pub mm: u32,
    pub files: u32,
}

/// Offsets into `mm_struct`.
///
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub struct MmOffsets {
    pub pgd: u32,
}

/// Offsets into `files_struct`.
///
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub struct FilesOffsets {
    pub fdt: u32,
}

/// Offsets into `fdtable`.
///
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub struct FdtableOffsets {
    pub max_fds: u32,
    pub fd: u32,
}

/// Offsets into `struct file`.
///
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub struct FileOffsets {
    pub inode: u32,
}

/// Offsets into `struct inode`.
///
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub struct InodeOffsets {
    pub mode: u32,
    pub size: u32,
    pub ino: u32,
}

/// Every offset discovery needs for one kernel version.
///
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct KernelProfile {
    /// The version substring this profile matches, e.g. `"5.15"`.
    pub version: String,

    /// Sub-page offsets at which `task_struct`s have been observed
    /// within their slabs. A hint: the scan re-derives the list
    /// per run and uses this as seed and fallback.
    pub slab_offsets: Vec<u32>,

    pub task: TaskOffsets,
    pub mm: MmOffsets,
    pub files: FilesOffsets,
    pub fdt: FdtableOffsets,
    pub file: FileOffsets,
    pub inode: InodeOffsets,
}

/// A failed profile-table load.
///
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile table is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("profile table contains no profiles")]
    Empty,
}

#[derive(Debug, Deserialize)]
struct ProfileTable {
    #[serde(rename = "profile")]
    profiles: Vec<KernelProfile>,
}

/// The loaded profile table.
///
#[derive(Clone, Debug)]
pub struct KernelProfiles {
    profiles: Vec<KernelProfile>,
}

impl KernelProfiles {
    /// Returns the built-in table of common kernels.
    ///
    /// ## Panics
    ///
    /// Never in practice: the built-in table is validated by test.
    ///
    pub fn builtin() -> Self {
        Self::from_toml(BUILTIN_PROFILES).expect("built-in profile table is valid")
    }

    /// Parses a profile table from TOML.
    ///
    pub fn from_toml(text: &str) -> Result<Self, ProfileError> {
        let table: ProfileTable = toml::from_str(text)?;
        if table.profiles.is_empty() {
            return Err(ProfileError::Empty);
        }

        Ok(KernelProfiles {
            profiles: table.profiles,
        })
    }

    /// Returns the profiles in table order.
    ///
    pub fn profiles(&self) -> &[KernelProfile] {
        &self.profiles
    }

    /// Selects the profile for a kernel version banner.
    ///
    /// The first profile whose `version` is a substring of the
    /// banner wins; with no banner or no match, the table's first
    /// profile is the fallback.
    ///
    pub fn select(&self, banner: Option<&str>) -> &KernelProfile {
        if let Some(banner) = banner {
            if let Some(profile) = self
                .profiles
                .iter()
                .find(|profile| banner.contains(&profile.version))
            {
                return profile;
            }
        }

        &self.profiles[0]
    }
}
