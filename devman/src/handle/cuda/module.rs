use super::{driver, Context, Pushed};
use common::{DriverError, DriverResult};
use cuda::bindings::{CUcontext, CUfunction, CUjit_option, CUmodule};
use log::{info, warn};
use std::{
    ffi::{c_char, c_uint, c_void, CStr, CString},
    ptr::null_mut,
    sync::Arc,
};

const JIT_OPTIMIZATION_LEVEL: usize = 4;
const JIT_LOG_SIZE: usize = 2048;

/// 加载到上下文中的设备程序。
pub(crate) struct Module {
    raw: CUmodule,
    ctx: CUcontext,
}

unsafe impl Send for Module {}
unsafe impl Sync for Module {}

impl Module {
    /// 以固定优化等级加载编译好的程序，日志缓冲区大小有限。
    pub fn load(ctx: &Context, image: &[u8]) -> DriverResult<Self> {
        // PTX 文本需要以 '\0' 结尾，二进制镜像多一个字节无害
        let mut image = image.to_vec();
        if image.last() != Some(&0) {
            image.push(0);
        }

        let mut info_log = [0 as c_char; JIT_LOG_SIZE];
        let mut error_log = [0 as c_char; JIT_LOG_SIZE];
        let mut options = [
            CUjit_option::CU_JIT_OPTIMIZATION_LEVEL,
            CUjit_option::CU_JIT_INFO_LOG_BUFFER_SIZE_BYTES,
            CUjit_option::CU_JIT_INFO_LOG_BUFFER,
            CUjit_option::CU_JIT_ERROR_LOG_BUFFER_SIZE_BYTES,
            CUjit_option::CU_JIT_ERROR_LOG_BUFFER,
        ];
        let mut values: [*mut c_void; 5] = [
            JIT_OPTIMIZATION_LEVEL as _,
            JIT_LOG_SIZE as _,
            info_log.as_mut_ptr().cast(),
            JIT_LOG_SIZE as _,
            error_log.as_mut_ptr().cast(),
        ];

        let _guard = ctx.push()?;
        let mut raw = null_mut();
        let result = driver!(cuModuleLoadDataEx(
            &mut raw,
            image.as_ptr().cast(),
            options.len() as c_uint,
            options.as_mut_ptr(),
            values.as_mut_ptr(),
        ));
        match result {
            Ok(()) => {
                let log = read_log(&info_log);
                if !log.is_empty() {
                    info!("{log}");
                }
                Ok(Self {
                    raw,
                    ctx: ctx.as_raw(),
                })
            }
            Err(e) => {
                warn!("{}", read_log(&error_log));
                Err(e)
            }
        }
    }

    /// 查找入口函数，找不到时返回 [`DriverError::NOT_FOUND`]。
    pub fn function(self: &Arc<Self>, name: &str) -> DriverResult<Function> {
        let name = CString::new(name).map_err(|_| DriverError::INVALID_VALUE)?;
        let _guard = Pushed::new(self.ctx)?;
        let mut raw = null_mut();
        driver!(cuModuleGetFunction(&mut raw, self.raw, name.as_ptr()))?;
        Ok(Function {
            raw,
            _module: self.clone(),
        })
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        if let Ok(_guard) = Pushed::new(self.ctx) {
            let _ = driver!(cuModuleUnload(self.raw));
        }
    }
}

/// 程序中的一个入口，持有程序使其不被卸载。
pub(crate) struct Function {
    raw: CUfunction,
    _module: Arc<Module>,
}

unsafe impl Send for Function {}
unsafe impl Sync for Function {}

impl Function {
    #[inline]
    pub fn as_raw(&self) -> CUfunction {
        self.raw
    }
}

fn read_log(buf: &[c_char]) -> String {
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .trim_end()
        .to_string()
}
