use super::driver;
use common::DriverResult;
use cuda::bindings::{CUcontext, CUdevice};
use std::{marker::PhantomData, ptr::null_mut};

/// 设备独占的执行上下文。
pub(crate) struct Context(CUcontext);

// 上下文句柄可以在任意线程上压栈使用。
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    pub fn new(dev: CUdevice) -> DriverResult<Self> {
        let mut raw = null_mut();
        driver!(cuCtxCreate_v2(&mut raw, 0, dev))?;
        let ctx = Self(raw);
        // 新建的上下文会被压入当前线程，弹出以免影响调用者
        let mut popped = null_mut();
        driver!(cuCtxPopCurrent_v2(&mut popped))?;
        Ok(ctx)
    }

    #[inline]
    pub fn as_raw(&self) -> CUcontext {
        self.0
    }

    /// 只有当前线程的上下文不是这个上下文时才切换。
    pub fn make_current(&self) -> DriverResult {
        if !is_current(self.0)? {
            driver!(cuCtxSetCurrent(self.0))?;
        }
        Ok(())
    }

    #[inline]
    pub fn push(&self) -> DriverResult<Pushed> {
        Pushed::new(self.0)
    }
}

impl Drop for Context {
    #[inline]
    fn drop(&mut self) {
        let _ = driver!(cuCtxDestroy_v2(self.0));
    }
}

fn is_current(ctx: CUcontext) -> DriverResult<bool> {
    let mut current = null_mut();
    driver!(cuCtxGetCurrent(&mut current))?;
    Ok(current == ctx)
}

/// 作用域内保证上下文为当前上下文，离开作用域时恢复。
///
/// 上下文栈属于线程，守卫不能跨线程移动。
pub(crate) struct Pushed {
    pushed: bool,
    _not_send: PhantomData<*const ()>,
}

impl Pushed {
    pub fn new(ctx: CUcontext) -> DriverResult<Self> {
        let pushed = if is_current(ctx)? {
            false
        } else {
            driver!(cuCtxPushCurrent_v2(ctx))?;
            true
        };
        Ok(Self {
            pushed,
            _not_send: PhantomData,
        })
    }
}

impl Drop for Pushed {
    #[inline]
    fn drop(&mut self) {
        if self.pushed {
            let mut popped = null_mut();
            let _ = driver!(cuCtxPopCurrent_v2(&mut popped));
        }
    }
}
