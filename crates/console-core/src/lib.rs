pub mod config;
pub mod context;
pub mod error;
pub mod options;
pub mod types;

pub use context::OpContext;
pub use error::{CatalogError, ClusterError, ConsoleError, ProbeError, Result};
