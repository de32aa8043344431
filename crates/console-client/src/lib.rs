pub mod current;
pub mod facade;
pub mod generation;
pub mod legacy;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod probe;

pub use current::EtcdConnector;
pub use facade::{ClientFacade, ClusterClient, KeepAlive, RetryPolicy};
pub use generation::{Connector, CurrentKv, LegacyKv};
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemberHealth, MemoryCluster};
