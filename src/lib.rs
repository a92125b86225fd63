mod filters;
pub(crate) use filters::{SubsystemFilter, TagFilter};
mod hash;
mod wire;
mod ebpf;
mod device;
pub use device::{Action, Device};
mod monitor;
pub use monitor::{EventSource, Monitor};
mod ctx;
pub use ctx::{LogPriority, Udev};

pub(crate) use std::borrow::Cow;
