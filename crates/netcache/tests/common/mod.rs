//! Shared fixtures for netcache integration tests.

pub mod harness;

pub use harness::*;
