//! Pipeline execution: context, driver and result assembly.

mod context;
mod driver;
mod result;

pub use context::{CancellationHandle, RuntimeConfig};
pub use driver::PipelineRunner;
pub use result::QueryResult;
