//! Handlers of the disk reconciliation chain.
//!
//! Listed in the order the chain runs them. Later handlers read conditions
//! written by earlier ones on the staged copy of the disk.

pub mod datasource_ready;
pub mod init;
pub mod inuse;
pub mod lifecycle;
pub mod migration;
pub mod protection;
pub mod resizing;
pub mod snapshotting;
pub mod stats;
pub mod storage_class_ready;

pub use datasource_ready::DatasourceReadyHandler;
pub use init::InitHandler;
pub use inuse::InUseHandler;
pub use lifecycle::LifecycleHandler;
pub use migration::MigrationHandler;
pub use protection::ProtectionHandler;
pub use resizing::ResizingHandler;
pub use snapshotting::SnapshottingHandler;
pub use stats::StatsHandler;
pub use storage_class_ready::StorageClassReadyHandler;
