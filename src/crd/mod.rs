//! Custom Resource Definitions (CRDs) for vdisk-operator.
//!
//! - `VirtualDisk`: the reconciled disk resource
//! - `VirtualMachine`, `VirtualMachineOperation`: consumers of disks
//! - `VirtualImage`, `ClusterVirtualImage`: upstream sources and consumers
//! - `VirtualDiskSnapshot`, `VolumeSnapshot`: snapshot sources
//! - `DataVolume`: the import job filling a claim

mod conditions;
mod data_volume;
mod image;
mod snapshot;
mod virtual_disk;
mod virtual_machine;

pub use conditions::*;
pub use data_volume::*;
pub use image::*;
pub use snapshot::*;
pub use virtual_disk::*;
pub use virtual_machine::*;
