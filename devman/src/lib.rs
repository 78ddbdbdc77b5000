// #![deny(warnings)]

mod buffer;
mod device;
mod handle;
mod kernel;
mod manager;
mod thread_data;

pub mod topology;

pub use buffer::DeviceBuffer;
pub use common::{check, DeviceError, DriverError, DriverResult, ErrorCode};
pub use device::{ContextGuard, Device, DeviceParams, DriverMode, InfoFmt, LinkMask};
pub use handle::common_cpu;
pub use kernel::{Arg, Kernel, KERNEL_ARG_POOL, MAX_KERNEL_ARGS};
pub use manager::DeviceManager;
pub use thread_data::{LaunchGeometry, ThreadData, MAX_GROUP_SIZE};

pub use common_cpu::{HostFn, HostProgram, WorkItem};
