pub mod errors;
pub mod exec;
pub mod fuse;
pub mod ir;
pub mod types;

pub use errors::{FuseError, FuseResult};
pub use fuse::{batch_fuse, BatchFuseOutput};
pub use types::{Gap, OpId, TensorId};
