// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Functional tests for the VirtualDisk controllers.
//!
//! These tests drive whole reconciliation passes against the in-memory
//! store WITHOUT requiring a live Kubernetes cluster. Objects the
//! controllers do not own (claims binding, machines running, images being
//! built) are changed between passes the way the cluster would.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_class_change_starts_migration
//! ```
//!
//! ## Test Categories
//!
//! - **Provisioning tests**: blank disk from nothing to Ready
//! - **InUse tests**: attachment tracking, reason priority, protection
//! - **Migration tests**: storage class migration, revert, completion and
//!   the volume migration orchestrator

mod harness;
mod inuse_tests;
mod migration_tests;
mod provisioning_tests;
