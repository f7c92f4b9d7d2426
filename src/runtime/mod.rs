//! Runtime system
//!
//! Node-local memory, the region directory and the cooperative task scheduler.

pub mod directory;
pub mod memory;
pub mod scheduler;
