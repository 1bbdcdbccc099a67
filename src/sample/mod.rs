//! Sample-state hierarchy: plate → well → field → channel / z-slice.
//!
//! - [`key`]: typed identifying fields and container paths
//! - [`store`]: the shared in-memory hierarchy with per-node locking
//! - [`loader`]: builds the hierarchy from a declarative CSV file

pub mod key;
pub mod loader;
pub mod store;

pub use key::{ChannelId, ContainerPath, KeyFields, NodeKind, Segment};
pub use loader::{HierarchyLoader, LoadReport, RowFailure};
pub use store::{Attributes, NodeRef, NodeTree, SampleStore};
