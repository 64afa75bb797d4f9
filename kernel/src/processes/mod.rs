//! Process control blocks, their saved register state and the process table.

pub mod process;
pub mod registers;
pub mod table;

pub use process::{Pcb, Pid, ProcessInfo, ProcessState, ProcessStats, WaitStatus};
pub use registers::{Context, ContextError};
