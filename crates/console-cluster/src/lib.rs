pub mod backup;
pub mod status;

pub use backup::BackupCatalog;
pub use status::aggregate;
