mod event;
mod line;
mod log;

pub use event::{EventPayload, InstanceEvent, InternalEvent};
pub use line::{StreamLine, StreamSource};
pub use log::LogMeta;
