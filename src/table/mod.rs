//! Table descriptors and the in-memory row set

mod rowset;
mod spec;

pub use rowset::{Cell, RaggedRow, RowSet};
pub use spec::{MergePolicy, TableSpec, is_identifier};
