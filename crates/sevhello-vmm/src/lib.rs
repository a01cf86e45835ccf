//! sevhello: a minimal KVM monitor with AMD SEV launch and migration.
//!
//! The monitor runs a tiny guest in one of four x86 privilege modes on a
//! single vCPU, optionally as an SEV-encrypted guest, and can export the
//! encrypted guest memory to a file that a second instance imports and
//! runs.
//!
//! # Architecture
//!
//! - [`vm`]: KVM handles, guest memory registration, SEV context, error taxonomy
//! - [`vcpu`]: vCPU register setup and the exit dispatch loop
//! - [`memory`]: Bounds-checked guest memory and the fixed layout
//! - [`layout`]: Page tables and register state per privilege mode
//! - [`sev`]: SEV firmware commands and the launch state machine
//! - [`migration`]: Framed export and import of encrypted memory
//! - [`certs`]: Transport certificates for `SEND_START`
//! - [`guest`]: Built-in guest programs
//! - [`devices`]: The debug console
//! - [`runner`]: One full run, end to end
//! - [`verified`]: Pure page-table, descriptor and transfer arithmetic

pub mod certs;
pub mod config;
pub mod devices;
pub mod guest;
pub mod layout;
pub mod memory;
pub mod migration;
pub mod runner;
pub mod sev;
pub mod vcpu;
pub mod verified;
pub mod vm;

pub use config::{MigrationRole, PrivilegeMode, VmConfig};
pub use vm::{ErrorKind, VirtualMachine, VmError};
