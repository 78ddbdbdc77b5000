//! 直接调用驱动接口，结果码原样向上传递。

mod context;
mod memory;
mod module;
mod stream;

pub(crate) use context::{Context, Pushed};
pub(crate) use memory::DevMem;
pub(crate) use module::{Function, Module};
pub(crate) use stream::Stream;

use common::{DriverError, DriverResult};
use cuda::bindings::{CUdevice, CUdevice_attribute, CUresult};
use std::ffi::{c_char, c_int, CStr};

macro_rules! driver {
    ($f:ident($($arg:expr),* $(,)?)) => {
        ::common::check(unsafe { ::cuda::bindings::$f($($arg),*) } as i32, stringify!($f))
    };
}
pub(crate) use driver;

/// 初始化驱动并返回设备数量。
///
/// 驱动不可用是正常情况，不打印错误，由调用者决定如何回退。
pub(crate) fn init() -> DriverResult<usize> {
    let result = unsafe { cuda::bindings::cuInit(0) };
    if result != CUresult::CUDA_SUCCESS {
        return Err(DriverError(result as _));
    }
    let mut count: c_int = 0;
    driver!(cuDeviceGetCount(&mut count))?;
    Ok(count as _)
}

pub(crate) fn device(index: usize) -> DriverResult<CUdevice> {
    let mut dev: CUdevice = 0;
    driver!(cuDeviceGet(&mut dev, index as c_int))?;
    Ok(dev)
}

pub(crate) fn name(dev: CUdevice) -> DriverResult<String> {
    let mut name = [0 as c_char; 256];
    driver!(cuDeviceGetName(name.as_mut_ptr(), name.len() as c_int, dev))?;
    Ok(unsafe { CStr::from_ptr(name.as_ptr()) }
        .to_string_lossy()
        .into_owned())
}

pub(crate) fn attribute(dev: CUdevice, attr: CUdevice_attribute) -> DriverResult<i32> {
    let mut value: c_int = 0;
    driver!(cuDeviceGetAttribute(&mut value, attr, dev))?;
    Ok(value)
}

pub(crate) fn total_mem(dev: CUdevice) -> DriverResult<usize> {
    let mut bytes = 0usize;
    driver!(cuDeviceTotalMem_v2(&mut bytes, dev))?;
    Ok(bytes)
}
