//! Pure functions behind the effectful VMM shell.
//!
//! Everything under this module takes values in and returns values out:
//! no ioctls, no guest-memory access, no logging.  The imperative code in
//! [`crate::layout`], [`crate::memory`] and [`crate::migration`] delegates
//! its arithmetic here so it can be tested exhaustively without `/dev/kvm`.
//!
//! Non-trivial functions carry `debug_assert!` pre- and postconditions.

pub mod paging;
pub mod segment;
pub mod transfer;
