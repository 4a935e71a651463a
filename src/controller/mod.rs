//! Controller module for vdisk-operator.
//!
//! Contains the disk reconciliation chain, its handlers, condition
//! bookkeeping, error handling and the provisioning sources.
//!
//! This module supports two controllers:
//! - VirtualDisk controller (`reconciler` running the `handlers` chain)
//! - Volume migration orchestrator (`volume_migration`)

// Shared modules
pub mod common;
pub mod context;
pub mod error;
pub mod handler;
pub mod status;

// Decisions and services used by the handlers
pub mod attachment;
pub mod migration;
pub mod pipeline;
pub mod progress;
pub mod sources;
pub mod storage_class;

// VirtualDisk controller
pub mod handlers;
pub mod reconciler;

// Volume migration orchestrator
pub mod volume_migration;
