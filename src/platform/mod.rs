//! Platform abstraction layer.

pub mod pal;

pub use pal::{LinuxPlatform, MemoryInfo, MockPlatform, MountPoint, Platform, detect_platform};
