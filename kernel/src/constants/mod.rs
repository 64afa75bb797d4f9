//! System-wide constants and compile-time defaults.

pub mod memory;
pub mod processes;
