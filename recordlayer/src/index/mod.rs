//! Secondary indexes: descriptors, lifecycle state, diff-based maintenance, online building, and
//! mutual (bidirectional) indexes.

pub mod descriptor;
pub mod maintainer;
pub mod mutual;
pub mod online;
pub mod rangeset;
pub mod state;

pub use descriptor::{FieldExpr, IndexDescriptor, IndexKind, UniquenessCheckMode};
pub use maintainer::IndexMaintainer;
pub use mutual::{mutual_descriptors, MutualIndexConfig};
pub use online::{FieldDecoder, OnlineIndexConfig, OnlineIndexReport, OnlineIndexer};
pub use rangeset::{RangeSet, RangeSetStore};
pub use state::{IndexState, IndexStateManager};
