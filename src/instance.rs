mod handle;
mod types;

pub use handle::InstanceHandle;
pub use types::{InstanceId, InstanceStatus};
