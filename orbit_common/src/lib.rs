//! Orbit Common Library
//!
//! This crate provides the static data model shared by every participant of
//! the Orbit record bus: process roles, record schemas, the role table that
//! assigns field ownership, and configuration loading.
//!
//! # Module Structure
//!
//! - [`role`] - Process role identities
//! - [`schema`] - Record schemas, field types and field values
//! - [`table`] - Role table built from configuration (ownership validation)
//! - [`binding`] - Per-role `ProcessRoleAdapter`
//! - [`config`] - Configuration loading traits and types
//! - [`consts`] - Bus-wide defaults and file naming
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! orbit = { package = "orbit_common", path = "../orbit_common" }
//! ```
//!
//! Then import:
//! ```rust
//! use orbit_common::config::{ConfigLoader, SharedConfig};
//! use orbit_common::role::ProcessRole;
//! ```

pub mod binding;
pub mod config;
pub mod consts;
pub mod prelude;
pub mod role;
pub mod schema;
pub mod table;
