//! Run configuration.
//!
//! A [`VmConfig`] is built once by the caller and passed by reference to
//! every stage; nothing reads the mode or role from global state.

use std::fmt;

use crate::memory::DEFAULT_MEMORY_SIZE;

/// CPU mode the guest starts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrivilegeMode {
    /// 16-bit real mode, no paging.
    #[default]
    Real,
    /// 32-bit protected mode, no paging.
    Protected,
    /// 32-bit protected mode with 4 MiB PSE paging.
    Paged32,
    /// 64-bit long mode with four-level paging.
    Long,
}

impl PrivilegeMode {
    pub const ALL: [PrivilegeMode; 4] = [
        PrivilegeMode::Real,
        PrivilegeMode::Protected,
        PrivilegeMode::Paged32,
        PrivilegeMode::Long,
    ];

    /// Width in bytes of the result-slot comparison after halt.
    pub const fn check_width(self) -> usize {
        match self {
            PrivilegeMode::Real => 2,
            PrivilegeMode::Protected | PrivilegeMode::Paged32 => 4,
            PrivilegeMode::Long => 8,
        }
    }

    pub const fn uses_paging(self) -> bool {
        matches!(self, PrivilegeMode::Paged32 | PrivilegeMode::Long)
    }

    pub const fn name(self) -> &'static str {
        match self {
            PrivilegeMode::Real => "real",
            PrivilegeMode::Protected => "protected",
            PrivilegeMode::Paged32 => "paged32",
            PrivilegeMode::Long => "long",
        }
    }
}

impl fmt::Display for PrivilegeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Part this instance plays in an encrypted-memory migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationRole {
    /// Plain guest, no SEV.
    #[default]
    None,
    /// SEV launch, then export to a destination using our own certificates.
    SourceLocal,
    /// SEV launch, then export to a destination with separate certificates.
    SourceRemote,
    /// Import a previously exported guest instead of launching one.
    Sink,
}

impl MigrationRole {
    /// Whether guest memory is SEV-encrypted under this role.
    pub const fn is_confidential(self) -> bool {
        !matches!(self, MigrationRole::None)
    }

    pub const fn is_source(self) -> bool {
        matches!(self, MigrationRole::SourceLocal | MigrationRole::SourceRemote)
    }

    pub const fn is_sink(self) -> bool {
        matches!(self, MigrationRole::Sink)
    }

    pub const fn name(self) -> &'static str {
        match self {
            MigrationRole::None => "none",
            MigrationRole::SourceLocal => "source-local",
            MigrationRole::SourceRemote => "source-remote",
            MigrationRole::Sink => "sink",
        }
    }
}

impl fmt::Display for MigrationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything needed to build and run one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Guest RAM in bytes, mapped at guest-physical 0.
    pub memory_size: usize,
    pub mode: PrivilegeMode,
    pub role: MigrationRole,
    /// SEV guest policy for launch and receive.
    pub policy: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            mode: PrivilegeMode::default(),
            role: MigrationRole::default(),
            policy: 0,
        }
    }
}

impl VmConfig {
    pub fn new(mode: PrivilegeMode, role: MigrationRole) -> Self {
        Self {
            mode,
            role,
            ..Self::default()
        }
    }

    pub fn with_memory_size(mut self, memory_size: usize) -> Self {
        self.memory_size = memory_size;
        self
    }
}
