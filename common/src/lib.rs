#![deny(warnings)]

mod error;

pub use error::{check, DeviceError, DriverError, DriverResult, ErrorCode};
