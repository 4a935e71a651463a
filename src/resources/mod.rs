//! Resource generation module.
//!
//! Contains generators for the objects created on behalf of a VirtualDisk.
//!
//! ## Resources Generated
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | PersistentVolumeClaim | Storage backing the disk (blank, snapshot restore, migration target) |
//! | DataVolume | Import job populating the claim |
//! | VirtualMachineOperation | Relocation of the consumer during volume migration |

pub mod claim;
pub mod common;
pub mod data_volume;
pub mod operation;

// Re-export commonly used items from common
pub use common::{is_owned_by, owner_reference, standard_labels};
