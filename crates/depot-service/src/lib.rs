//! The caching core of depot.
//!
//! Depot serves files of remote origins and resized variants of local images, both from a disk
//! cache that is populated on demand. See the [`caching`] module for how artifacts are kept
//! fresh, and the [`services`] module for the two kinds of artifacts.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod download;
pub mod services;
pub mod transform;
pub mod utils;
