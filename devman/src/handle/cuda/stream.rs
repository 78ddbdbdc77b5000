use super::{driver, Context, Function, Pushed};
use common::DriverResult;
use cuda::bindings::{CUcontext, CUstream, CUstream_flags};
use std::{
    ffi::{c_uint, c_void},
    ptr::null_mut,
};

/// 异步任务队列，只属于创建它的那个 `ThreadData`。
pub(crate) struct Stream {
    raw: CUstream,
    ctx: CUcontext,
}

unsafe impl Send for Stream {}
unsafe impl Sync for Stream {}

impl Stream {
    pub fn new(ctx: &Context) -> DriverResult<Self> {
        let _guard = ctx.push()?;
        let mut raw = null_mut();
        driver!(cuStreamCreate(
            &mut raw,
            CUstream_flags::CU_STREAM_NON_BLOCKING as c_uint
        ))?;
        Ok(Self {
            raw,
            ctx: ctx.as_raw(),
        })
    }

    #[inline]
    pub fn as_raw(&self) -> CUstream {
        self.raw
    }

    pub fn launch(
        &self,
        f: &Function,
        grid_dims: c_uint,
        block_dims: c_uint,
        params: &mut [*mut c_void],
    ) -> DriverResult {
        let _guard = Pushed::new(self.ctx)?;
        driver!(cuLaunchKernel(
            f.as_raw(),
            grid_dims,
            1,
            1,
            block_dims,
            1,
            1,
            0,
            self.raw,
            params.as_mut_ptr(),
            null_mut(),
        ))
    }

    #[inline]
    pub fn synchronize(&self) -> DriverResult {
        driver!(cuStreamSynchronize(self.raw))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Ok(_guard) = Pushed::new(self.ctx) {
            let _ = driver!(cuStreamDestroy_v2(self.raw));
        }
    }
}
