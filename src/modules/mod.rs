//! Core magic mount modules.
//!
//! This module provides the building blocks of a run:
//!
//! - `catalog`: Module discovery and root markers
//! - `partition`: Partition set resolution
//! - `node`: Candidate sets and conflict resolution for one path
//! - `merge`: Staging of merged trees
//! - `mount`: Mount table access and activation of staged trees
//! - `label`: Security labels and opaque markers
//! - `session`: A complete merge-and-activate run

pub mod catalog;
pub mod config;
pub mod constants;
pub mod label;
pub mod merge;
pub mod mount;
/// Privilege checks and mount namespace entry.
pub mod namespace;
pub mod node;
pub mod partition;
pub mod session;
pub mod staging;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;
