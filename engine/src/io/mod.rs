//! I/O helpers shared by the engine's adapters.

pub mod config;
pub mod process;
