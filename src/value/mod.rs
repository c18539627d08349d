//! Value model: tagged runtime values and the snapshot primitive.

pub mod snapshot;
pub mod types;

pub use snapshot::{deep_copy, SnapshotError};
pub use types::{ForeignValue, FunctionValue, NativeFunction, StructType, StructValue, Value};
