use crate::{handle::common_cpu::Blob, Arg, Device, ThreadData};
use bytemuck::{cast_slice, cast_slice_mut, Pod};
use common::{DriverError, DriverResult};
use log::{error, trace};
use std::{ffi::c_void, fmt, ptr::null};

#[cfg(use_cuda)]
use crate::handle::cuda::DevMem;

enum Mem {
    Empty,
    Host(Blob),
    #[cfg(use_cuda)]
    Device(DevMem),
}

/// 一块设备存储，模拟模式下放在宿主机上。
///
/// 缓冲区不记录所属的设备：调用者负责在分配、释放和传输之前使正确的上下文成为当前上下文。
pub struct DeviceBuffer {
    name: String,
    mem: Mem,
    size: usize,
    emulate: bool,
}

impl DeviceBuffer {
    pub fn new(name: impl Into<String>, emulate: bool) -> Self {
        Self {
            name: name.into(),
            mem: Mem::Empty,
            size: 0,
            emulate,
        }
    }

    /// 与 `device` 存储方式一致的空缓冲区。
    #[inline]
    pub fn on(device: &Device, name: impl Into<String>) -> Self {
        Self::new(name, device.is_emulator())
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_emulated(&self) -> bool {
        self.emulate
    }

    /// 存储的起始地址，没有分配时为空指针。
    pub fn as_ptr(&self) -> *const c_void {
        match &self.mem {
            Mem::Empty => null(),
            Mem::Host(blob) => blob.as_ptr().cast(),
            #[cfg(use_cuda)]
            Mem::Device(mem) => mem.as_ptr(),
        }
    }

    /// 作为内核的指针参数。
    #[inline]
    pub fn arg(&self) -> Arg {
        Arg::Ptr(self.as_ptr())
    }

    /// 释放已有的存储，再分配 `size` 字节。`size` 为 0 时只释放。
    pub fn alloc(&mut self, size: usize) -> DriverResult {
        self.free()?;
        if size == 0 {
            return Ok(());
        }
        self.mem = if self.emulate {
            Mem::Host(Blob::new(size).ok_or(DriverError::OUT_OF_MEMORY)?)
        } else {
            Self::alloc_device(size)?
        };
        self.size = size;
        trace!("{}: {size} bytes allocated", self.name);
        Ok(())
    }

    #[cfg(use_cuda)]
    fn alloc_device(size: usize) -> DriverResult<Mem> {
        DevMem::alloc(size).map(Mem::Device)
    }

    #[cfg(not(use_cuda))]
    fn alloc_device(_size: usize) -> DriverResult<Mem> {
        Err(DriverError::NO_DEVICE)
    }

    /// 释放存储，可以重复调用。
    pub fn free(&mut self) -> DriverResult {
        let mem = std::mem::replace(&mut self.mem, Mem::Empty);
        self.size = 0;
        match mem {
            Mem::Empty | Mem::Host(_) => Ok(()),
            #[cfg(use_cuda)]
            Mem::Device(mem) => mem.free(),
        }
    }

    /// 把 `src` 同步复制到存储的开头。
    pub fn upload<T: Pod>(&mut self, src: &[T]) -> DriverResult {
        let src: &[u8] = cast_slice(src);
        self.check_capacity(src.len())?;
        match &mut self.mem {
            Mem::Empty => unreachable!(),
            Mem::Host(blob) => blob.as_mut_slice()[..src.len()].copy_from_slice(src),
            #[cfg(use_cuda)]
            Mem::Device(mem) => mem.copy_from_host(src)?,
        }
        Ok(())
    }

    /// 在 `thread` 的队列上复制 `src` 到存储的开头，只入队不等待。
    ///
    /// # Safety
    ///
    /// 在 `thread` 等待完成之前，`src` 和缓冲区都必须保持有效且不被修改。
    pub unsafe fn upload_async<T: Pod>(&mut self, src: &[T], thread: &ThreadData) -> DriverResult {
        let src: &[u8] = cast_slice(src);
        self.check_capacity(src.len())?;
        match &mut self.mem {
            Mem::Empty => unreachable!(),
            Mem::Host(blob) => {
                let _ = thread;
                blob.as_mut_slice()[..src.len()].copy_from_slice(src)
            }
            #[cfg(use_cuda)]
            Mem::Device(mem) => match thread.stream() {
                Some(stream) => mem.copy_from_host_async(src, stream)?,
                None => mem.copy_from_host(src)?,
            },
        }
        Ok(())
    }

    /// 把整个存储同步复制到 `dst`，`dst` 不能比存储短。
    pub fn download<T: Pod>(&self, dst: &mut [T]) -> DriverResult {
        let dst = self.host_window(dst)?;
        match &self.mem {
            Mem::Empty => unreachable!(),
            Mem::Host(blob) => dst.copy_from_slice(blob.as_slice()),
            #[cfg(use_cuda)]
            Mem::Device(mem) => mem.copy_to_host(dst)?,
        }
        Ok(())
    }

    /// 在 `thread` 的队列上把整个存储复制到 `dst`，只入队不等待。
    ///
    /// # Safety
    ///
    /// 在 `thread` 等待完成之前不能读写 `dst`，缓冲区必须保持有效。
    pub unsafe fn download_async<T: Pod>(
        &self,
        dst: &mut [T],
        thread: &ThreadData,
    ) -> DriverResult {
        let dst = self.host_window(dst)?;
        match &self.mem {
            Mem::Empty => unreachable!(),
            Mem::Host(blob) => {
                let _ = thread;
                dst.copy_from_slice(blob.as_slice())
            }
            #[cfg(use_cuda)]
            Mem::Device(mem) => match thread.stream() {
                Some(stream) => mem.copy_to_host_async(dst, stream)?,
                None => mem.copy_to_host(dst)?,
            },
        }
        Ok(())
    }

    fn check_capacity(&self, len: usize) -> DriverResult {
        if matches!(self.mem, Mem::Empty) {
            Err(DriverError::NOT_INITIALIZED)
        } else if len > self.size {
            Err(DriverError::OUT_OF_MEMORY)
        } else {
            Ok(())
        }
    }

    /// `dst` 开头与存储等长的部分。
    fn host_window<'a, T: Pod>(&self, dst: &'a mut [T]) -> DriverResult<&'a mut [u8]> {
        if matches!(self.mem, Mem::Empty) {
            return Err(DriverError::NOT_INITIALIZED);
        }
        let bytes: &mut [u8] = cast_slice_mut(dst);
        if bytes.len() < self.size {
            return Err(DriverError::INVALID_VALUE);
        }
        Ok(&mut bytes[..self.size])
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            error!("{}: failed to free on drop: {e}", self.name)
        }
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("ptr", &self.as_ptr())
            .field("emulate", &self.emulate)
            .finish()
    }
}
