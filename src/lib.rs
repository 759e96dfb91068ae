//! Host-hardening audit and remediation engine for Debian-family and
//! Alpine systems.
//!
//! The crate is organized dependencies-first: `core` holds the data model
//! (plan, platform, status, errors), `execution` the host-abstraction layer
//! (context, backups, file mutation, services), `engine` the module
//! contract plus the fixed-order driver, and `modules` one unit per
//! hardening concern. The binary in `main.rs` is a thin CLI over
//! [`engine::HardeningEngine`].

pub mod cli;
pub mod core;
pub mod engine;
pub mod execution;
pub mod modules;
pub mod utils;
