//! Platform-specific file and process primitives.

#[cfg(unix)]
mod linux;

#[cfg(unix)]
pub use linux::*;
