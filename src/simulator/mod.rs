//! Resource simulators: the threads that actually consume CPU, memory and disk.

pub mod backing;
pub mod cpu;
pub mod disk;
pub mod memory;
