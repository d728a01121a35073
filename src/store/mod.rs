//! Static function registry and the durable result store.
pub mod registry;
pub mod results;
pub mod types;

pub use registry::{Body, Registry};
pub use results::{Aggregation, ResultStore};
pub use types::{Arity, CallKey, CallLabel, FuncId, FunctionMeta};
