use super::{driver, Stream};
use common::DriverResult;
use cuda::bindings::CUdeviceptr;
use std::ffi::c_void;

/// 一块显存。不实现 `Drop`，由 `DeviceBuffer` 显式释放以便传递结果码。
///
/// 所有操作都要求调用线程上已经是正确的上下文。
pub(crate) struct DevMem(CUdeviceptr);

impl DevMem {
    pub fn alloc(size: usize) -> DriverResult<Self> {
        let mut ptr: CUdeviceptr = 0;
        driver!(cuMemAlloc_v2(&mut ptr, size))?;
        Ok(Self(ptr))
    }

    #[inline]
    pub fn free(self) -> DriverResult {
        driver!(cuMemFree_v2(self.0))
    }

    #[inline]
    pub fn as_ptr(&self) -> *const c_void {
        self.0 as _
    }

    #[inline]
    pub fn copy_from_host(&mut self, src: &[u8]) -> DriverResult {
        driver!(cuMemcpyHtoD_v2(self.0, src.as_ptr().cast(), src.len()))
    }

    #[inline]
    pub fn copy_from_host_async(&mut self, src: &[u8], stream: &Stream) -> DriverResult {
        driver!(cuMemcpyHtoDAsync_v2(
            self.0,
            src.as_ptr().cast(),
            src.len(),
            stream.as_raw()
        ))
    }

    #[inline]
    pub fn copy_to_host(&self, dst: &mut [u8]) -> DriverResult {
        driver!(cuMemcpyDtoH_v2(dst.as_mut_ptr().cast(), self.0, dst.len()))
    }

    #[inline]
    pub fn copy_to_host_async(&self, dst: &mut [u8], stream: &Stream) -> DriverResult {
        driver!(cuMemcpyDtoHAsync_v2(
            dst.as_mut_ptr().cast(),
            self.0,
            dst.len(),
            stream.as_raw()
        ))
    }
}
