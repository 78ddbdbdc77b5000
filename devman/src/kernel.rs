use crate::{
    device::{Device, Program},
    handle::common_cpu::HostFn,
};
use common::{DriverError, DriverResult};
use std::{ffi::c_void, fmt, mem::size_of, ptr::from_ref, sync::Arc};

#[cfg(use_cuda)]
use crate::handle::cuda;

/// 一次启动最多能传递的参数个数。
pub const MAX_KERNEL_ARGS: usize = 1024;
/// 一次启动的参数总字节数上限。
pub const KERNEL_ARG_POOL: usize = 4096;

/// 内核参数，按值保存。
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Arg {
    Ptr(*const c_void),
    Int(i32),
    UInt(u32),
    Float(f32),
}

// 指针参数只是设备地址的值，不会在宿主机上解引用。
unsafe impl Send for Arg {}
unsafe impl Sync for Arg {}

impl Arg {
    #[inline]
    pub const fn size(&self) -> usize {
        match self {
            Self::Ptr(_) => size_of::<*const c_void>(),
            Self::Int(_) => size_of::<i32>(),
            Self::UInt(_) => size_of::<u32>(),
            Self::Float(_) => size_of::<f32>(),
        }
    }

    /// 指向参数值本身的指针，启动时传给驱动。
    #[cfg_attr(not(use_cuda), allow(dead_code))]
    pub(crate) fn as_param(&self) -> *mut c_void {
        match self {
            Self::Ptr(p) => from_ref(p).cast_mut().cast(),
            Self::Int(v) => from_ref(v).cast_mut().cast(),
            Self::UInt(v) => from_ref(v).cast_mut().cast(),
            Self::Float(v) => from_ref(v).cast_mut().cast(),
        }
    }

    /// 以 `T` 类型指针读取指针参数。
    ///
    /// # Panics
    ///
    /// 参数不是指针时 panic。
    #[inline]
    pub fn ptr<T>(self) -> *mut T {
        match self {
            Self::Ptr(p) => p.cast_mut().cast(),
            _ => panic!("{self:?} is not a pointer argument"),
        }
    }

    #[inline]
    pub fn int(self) -> i32 {
        match self {
            Self::Int(v) => v,
            _ => panic!("{self:?} is not an int argument"),
        }
    }

    #[inline]
    pub fn uint(self) -> u32 {
        match self {
            Self::UInt(v) => v,
            _ => panic!("{self:?} is not an unsigned argument"),
        }
    }

    #[inline]
    pub fn float(self) -> f32 {
        match self {
            Self::Float(v) => v,
            _ => panic!("{self:?} is not a float argument"),
        }
    }
}

impl From<i32> for Arg {
    #[inline]
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for Arg {
    #[inline]
    fn from(value: u32) -> Self {
        Self::UInt(value)
    }
}

impl From<f32> for Arg {
    #[inline]
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl<T> From<*const T> for Arg {
    #[inline]
    fn from(value: *const T) -> Self {
        Self::Ptr(value.cast())
    }
}

impl<T> From<*mut T> for Arg {
    #[inline]
    fn from(value: *mut T) -> Self {
        Self::Ptr(value.cast_const().cast())
    }
}

pub(crate) enum Function {
    Host(Arc<HostFn>),
    #[cfg(use_cuda)]
    Device(cuda::Function),
}

/// 已解析的内核入口和按顺序追加的参数列表。
///
/// 参数只能追加，顺序必须与入口函数的参数顺序一致。
pub struct Kernel<'dev> {
    name: String,
    device: &'dev Device,
    function: Function,
    args: Vec<Arg>,
    bytes: usize,
}

impl<'dev> Kernel<'dev> {
    /// 在设备已加载的程序中解析入口 `name`。
    ///
    /// # Panics
    ///
    /// 设备没有加载程序或程序中没有这个入口时 panic，这说明提供的程序与调用者预期的不符。
    pub fn new(device: &'dev Device, name: &str) -> Self {
        match Self::try_new(device, name) {
            Ok(kernel) => kernel,
            Err(e) => panic!(
                "failed to resolve kernel \"{name}\" on Device[{}]: {e}",
                device.index()
            ),
        }
    }

    pub fn try_new(device: &'dev Device, name: &str) -> DriverResult<Self> {
        let function = match device.program() {
            None => return Err(DriverError::INVALID_HANDLE),
            Some(Program::Host(program)) => {
                Function::Host(program.entry(name).ok_or(DriverError::NOT_FOUND)?)
            }
            #[cfg(use_cuda)]
            Some(Program::Device(module)) => Function::Device(module.function(name)?),
        };
        Ok(Self {
            name: name.into(),
            device,
            function,
            args: Vec::new(),
            bytes: 0,
        })
    }

    /// 追加一个参数。
    ///
    /// # Panics
    ///
    /// 参数个数或总字节数超过上限时 panic。
    pub fn push(&mut self, arg: impl Into<Arg>) -> &mut Self {
        let arg = arg.into();
        assert!(
            self.args.len() < MAX_KERNEL_ARGS,
            "kernel \"{}\" takes at most {MAX_KERNEL_ARGS} arguments",
            self.name,
        );
        assert!(
            self.bytes + arg.size() <= KERNEL_ARG_POOL,
            "kernel \"{}\" arguments exceed {KERNEL_ARG_POOL} bytes",
            self.name,
        );
        self.bytes += arg.size();
        self.args.push(arg);
        self
    }

    #[inline]
    pub fn push_ptr<T>(&mut self, ptr: *const T) -> &mut Self {
        self.push(ptr)
    }

    #[inline]
    pub fn push_int(&mut self, value: i32) -> &mut Self {
        self.push(value)
    }

    #[inline]
    pub fn push_uint(&mut self, value: u32) -> &mut Self {
        self.push(value)
    }

    #[inline]
    pub fn push_float(&mut self, value: f32) -> &mut Self {
        self.push(value)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn device(&self) -> &'dev Device {
        self.device
    }

    #[inline]
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// 参数占用的字节数。
    #[inline]
    pub fn arg_bytes(&self) -> usize {
        self.bytes
    }

    #[inline]
    pub(crate) fn function(&self) -> &Function {
        &self.function
    }
}

impl fmt::Debug for Kernel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("device", &self.device.index())
            .field("args", &self.args)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{Arg, Kernel, KERNEL_ARG_POOL, MAX_KERNEL_ARGS};
    use crate::{Device, HostProgram};
    use common::DriverError;
    use std::{ffi::c_void, mem::size_of, ptr::null};

    fn device() -> Device {
        let dev = Device::emulator(0);
        dev.set_host_program(HostProgram::new().define("scale", |_, _| {}))
            .unwrap();
        dev
    }

    #[test]
    fn test_args_in_order() {
        let dev = device();
        let data = [1.0f32; 4];
        let mut kernel = Kernel::new(&dev, "scale");
        kernel
            .push_ptr(data.as_ptr())
            .push_int(-3)
            .push_uint(7)
            .push_float(0.5);
        assert_eq!(
            kernel.args(),
            [
                Arg::Ptr(data.as_ptr().cast()),
                Arg::Int(-3),
                Arg::UInt(7),
                Arg::Float(0.5),
            ]
        );
        assert_eq!(kernel.arg_bytes(), size_of::<*const c_void>() + 12);
        assert_eq!(kernel.args()[0].ptr::<f32>().cast_const(), data.as_ptr());
        assert_eq!(kernel.args()[1].int(), -3);
    }

    #[test]
    fn test_param_points_to_value() {
        let arg = Arg::Int(42);
        assert_eq!(unsafe { *arg.as_param().cast::<i32>() }, 42);
        let arg = Arg::Ptr(0x1000 as *const c_void);
        assert_eq!(
            unsafe { *arg.as_param().cast::<*const c_void>() },
            0x1000 as *const c_void
        );
    }

    #[test]
    fn test_resolve() {
        let dev = Device::emulator(0);
        assert_eq!(
            Kernel::try_new(&dev, "scale").unwrap_err(),
            DriverError::INVALID_HANDLE
        );
        let dev = device();
        assert_eq!(
            Kernel::try_new(&dev, "missing").unwrap_err(),
            DriverError::NOT_FOUND
        );
        assert_eq!(Kernel::try_new(&dev, "scale").unwrap().name(), "scale");
    }

    #[test]
    #[should_panic(expected = "failed to resolve kernel")]
    fn test_unresolved_panics() {
        let dev = device();
        let _ = Kernel::new(&dev, "missing");
    }

    #[test]
    #[should_panic(expected = "at most")]
    fn test_too_many_args() {
        let dev = device();
        let mut kernel = Kernel::new(&dev, "scale");
        for i in 0..=MAX_KERNEL_ARGS {
            kernel.push_int(i as _);
        }
    }

    #[test]
    #[should_panic(expected = "exceed")]
    fn test_pool_overflow() {
        let dev = device();
        let mut kernel = Kernel::new(&dev, "scale");
        let n = KERNEL_ARG_POOL / size_of::<*const c_void>();
        for _ in 0..n {
            kernel.push_ptr(null::<u8>());
        }
        assert_eq!(kernel.arg_bytes(), KERNEL_ARG_POOL);
        kernel.push_int(0);
    }
}
