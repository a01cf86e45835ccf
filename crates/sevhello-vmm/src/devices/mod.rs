//! Emulated guest devices.
//!
//! The guest sees exactly one device: the debug console on port `0xE9`.

pub mod console;
