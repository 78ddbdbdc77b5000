use crate::{
    device::{Backend, Device},
    handle::common_cpu::ThisThread,
    kernel::{Function, Kernel},
};
use common::DriverResult;
use log::debug;
use std::ptr::eq;

#[cfg(use_cuda)]
use crate::handle::cuda;

/// 每个线程组的线程数上限。
pub const MAX_GROUP_SIZE: usize = 1024;

/// 一维启动网格。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LaunchGeometry {
    pub num_groups: usize,
    pub group_size: usize,
    /// 实际要处理的工作项数。
    pub work_size: usize,
}

impl LaunchGeometry {
    /// 工作量不为正时返回 `None`。
    ///
    /// 组大小向上取整，`num_groups * group_size` 不小于工作量。
    /// 工作量不能被组数整除时最后一组有多余的线程，设备内核需要检查全局索引是否越界。
    pub fn new(work_size: isize) -> Option<Self> {
        if work_size <= 0 {
            return None;
        }
        let work_size = work_size as usize;
        let num_groups = work_size.div_ceil(MAX_GROUP_SIZE);
        let group_size = work_size.div_ceil(num_groups);
        Some(Self {
            num_groups,
            group_size,
            work_size,
        })
    }

    #[inline]
    pub const fn threads(&self) -> usize {
        self.num_groups * self.group_size
    }
}

enum Queue {
    ThisThread(ThisThread),
    #[cfg(use_cuda)]
    Stream(cuda::Stream),
}

/// 绑定到一个设备的执行线程，独占一个异步任务队列。
///
/// 同一个设备上的多个 `ThreadData` 互不干扰，可以在不同线程上并发提交任务。
pub struct ThreadData<'dev> {
    device: &'dev Device,
    queue: Option<Queue>,
}

impl<'dev> ThreadData<'dev> {
    pub fn new(device: &'dev Device) -> DriverResult<Self> {
        let queue = match device.backend() {
            Backend::Emulated => Queue::ThisThread(ThisThread),
            #[cfg(use_cuda)]
            Backend::Cuda(ctx) => Queue::Stream(cuda::Stream::new(ctx)?),
        };
        Ok(Self {
            device,
            queue: Some(queue),
        })
    }

    #[inline]
    pub fn device(&self) -> &'dev Device {
        self.device
    }

    /// 异步启动内核，`work_size` 为线程总数。
    ///
    /// 工作量不为正时什么都不做。
    ///
    /// # Panics
    ///
    /// 内核不是在这个设备上解析的，或者队列已经释放。
    pub fn launch(&self, kernel: &Kernel, work_size: isize) -> DriverResult {
        let Some(geometry) = LaunchGeometry::new(work_size) else {
            return Ok(());
        };
        assert!(
            eq(kernel.device(), self.device),
            "kernel \"{}\" belongs to Device[{}], cannot launch on Device[{}]",
            kernel.name(),
            kernel.device().index(),
            self.device.index(),
        );
        debug!(
            "launch {} on Device[{}]: {} x {}",
            kernel.name(),
            self.device.index(),
            geometry.num_groups,
            geometry.group_size,
        );

        match (self.queue(), kernel.function()) {
            (Queue::ThisThread(queue), Function::Host(f)) => {
                queue.launch(&**f, geometry, kernel.args());
                Ok(())
            }
            #[cfg(use_cuda)]
            (Queue::Stream(stream), Function::Device(f)) => {
                use common::DriverError;
                use std::ffi::c_uint;

                let grid = c_uint::try_from(geometry.num_groups)
                    .map_err(|_| DriverError::INVALID_VALUE)?;
                let mut params = kernel.args().iter().map(|a| a.as_param()).collect::<Vec<_>>();
                stream.launch(f, grid, geometry.group_size as _, &mut params)
            }
            #[cfg(use_cuda)]
            _ => unreachable!("program and queue of one device always match"),
        }
    }

    /// 阻塞直到队列中已提交的任务全部完成。
    pub fn wait(&self) -> DriverResult {
        match self.queue() {
            Queue::ThisThread(_) => Ok(()),
            #[cfg(use_cuda)]
            Queue::Stream(stream) => stream.synchronize(),
        }
    }

    /// 释放队列，可以重复调用。
    #[inline]
    pub fn free_mem(&mut self) {
        self.queue = None;
    }

    #[cfg(use_cuda)]
    pub(crate) fn stream(&self) -> Option<&cuda::Stream> {
        match self.queue() {
            Queue::ThisThread(_) => None,
            Queue::Stream(stream) => Some(stream),
        }
    }

    fn queue(&self) -> &Queue {
        self.queue
            .as_ref()
            .unwrap_or_else(|| panic!("ThreadData of Device[{}] freed", self.device.index()))
    }
}

#[cfg(test)]
mod test {
    use super::{LaunchGeometry, ThreadData, MAX_GROUP_SIZE};
    use crate::{Arg, Device, DeviceBuffer, HostProgram, Kernel, WorkItem};
    use std::sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    };

    #[test]
    fn test_geometry() {
        assert_eq!(LaunchGeometry::new(0), None);
        assert_eq!(LaunchGeometry::new(-5), None);

        let g = LaunchGeometry::new(1600).unwrap();
        assert_eq!((g.num_groups, g.group_size), (2, 800));
        assert_eq!(g.threads(), 1600);

        let g = LaunchGeometry::new(1).unwrap();
        assert_eq!((g.num_groups, g.group_size), (1, 1));

        let g = LaunchGeometry::new(1024).unwrap();
        assert_eq!((g.num_groups, g.group_size), (1, 1024));

        for work in [1025, 3001, 4097, 1 << 20 | 7] {
            let g = LaunchGeometry::new(work).unwrap();
            assert!(g.group_size <= MAX_GROUP_SIZE);
            assert!(g.threads() >= work as usize);
            assert!(g.threads() - (work as usize) < g.num_groups);
        }
    }

    fn counting_device(counter: Arc<AtomicUsize>) -> Device {
        let dev = Device::emulator(0);
        dev.set_host_program(HostProgram::new().define("count", move |_, _| {
            counter.fetch_add(1, Relaxed);
        }))
        .unwrap();
        dev
    }

    #[test]
    fn test_empty_launch() {
        let counter = Arc::new(AtomicUsize::new(0));
        let dev = counting_device(counter.clone());
        let td = ThreadData::new(&dev).unwrap();
        let kernel = Kernel::new(&dev, "count");
        td.launch(&kernel, 0).unwrap();
        td.launch(&kernel, -1).unwrap();
        td.wait().unwrap();
        assert_eq!(counter.load(Relaxed), 0);
    }

    #[test]
    fn test_exact_coverage() {
        let counter = Arc::new(AtomicUsize::new(0));
        let dev = counting_device(counter.clone());
        let td = ThreadData::new(&dev).unwrap();
        let kernel = Kernel::new(&dev, "count");
        for work in [1, 1600, 3001] {
            counter.store(0, Relaxed);
            td.launch(&kernel, work).unwrap();
            td.wait().unwrap();
            assert_eq!(counter.load(Relaxed), work as usize);
        }
    }

    fn saxpy(item: WorkItem, args: &[Arg]) {
        let &[y, x, a, n] = args else {
            unreachable!()
        };
        let i = item.global_id;
        if i < n.int() as usize {
            unsafe { *y.ptr::<f32>().add(i) += a.float() * *x.ptr::<f32>().add(i) }
        }
    }

    #[test]
    fn test_concurrent_threads() {
        const N: usize = 3000;
        const THREADS: usize = 4;

        let dev = Device::emulator(0);
        dev.set_host_program(HostProgram::new().define("saxpy", saxpy))
            .unwrap();

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let dev = &dev;
                s.spawn(move || {
                    let td = ThreadData::new(dev).unwrap();
                    let x = vec![1.0f32; N];
                    let y = vec![t as f32; N];
                    let mut dx = DeviceBuffer::on(dev, "x");
                    let mut dy = DeviceBuffer::on(dev, "y");
                    dx.alloc(N * 4).unwrap();
                    dy.alloc(N * 4).unwrap();
                    dx.upload(&x).unwrap();
                    dy.upload(&y).unwrap();

                    let mut kernel = Kernel::new(dev, "saxpy");
                    kernel
                        .push(dy.arg())
                        .push(dx.arg())
                        .push_float(2.0)
                        .push_int(N as _);
                    td.launch(&kernel, N as _).unwrap();
                    td.wait().unwrap();

                    let mut ans = vec![0.0f32; N];
                    dy.download(&mut ans).unwrap();
                    assert!(ans.iter().all(|&v| v == t as f32 + 2.0));
                });
            }
        });
    }

    #[test]
    #[should_panic(expected = "cannot launch")]
    fn test_foreign_kernel() {
        let a = counting_device(Default::default());
        let b = counting_device(Default::default());
        let td = ThreadData::new(&a).unwrap();
        let kernel = Kernel::new(&b, "count");
        let _ = td.launch(&kernel, 1);
    }

    #[test]
    fn test_free_mem() {
        let dev = Device::emulator(0);
        let mut td = ThreadData::new(&dev).unwrap();
        td.free_mem();
        td.free_mem();
        assert!(std::ptr::eq(td.device(), &dev));
    }

    #[cfg(use_cuda)]
    const FILL: &str = "\
.version 6.0
.target sm_50
.address_size 64

.visible .entry fill(
    .param .u64 ptr,
    .param .u32 value,
    .param .u32 n
)
{
    .reg .pred %p<2>;
    .reg .b32 %r<8>;
    .reg .b64 %rd<4>;

    ld.param.u64 %rd1, [ptr];
    ld.param.u32 %r1, [value];
    ld.param.u32 %r2, [n];
    mov.u32 %r3, %ctaid.x;
    mov.u32 %r4, %ntid.x;
    mov.u32 %r5, %tid.x;
    mad.lo.s32 %r6, %r3, %r4, %r5;
    setp.ge.u32 %p1, %r6, %r2;
    @%p1 bra DONE;
    cvta.to.global.u64 %rd2, %rd1;
    mul.wide.u32 %rd3, %r6, 4;
    add.s64 %rd2, %rd2, %rd3;
    st.global.u32 [%rd2], %r1;
DONE:
    ret;
}
";

    #[cfg(use_cuda)]
    #[test]
    fn test_launch_on_device() {
        use crate::DeviceManager;

        const N: usize = 3001;

        let mut manager = DeviceManager::new();
        manager.init(false).unwrap();
        let dev = manager.device(0);
        if dev.is_emulator() {
            return;
        }
        dev.set_source(FILL.as_bytes()).unwrap();
        assert!(dev.has_program());
        dev.make_current().unwrap();

        let td = ThreadData::new(dev).unwrap();
        let mut buf = DeviceBuffer::on(dev, "fill");
        buf.alloc(N * 4).unwrap();
        buf.upload(&[0u32; N]).unwrap();

        let mut kernel = Kernel::new(dev, "fill");
        kernel.push(buf.arg()).push_uint(7).push_uint(N as _);
        td.launch(&kernel, N as _).unwrap();
        td.wait().unwrap();

        let mut ans = vec![0u32; N];
        buf.download(&mut ans).unwrap();
        assert!(ans.iter().all(|&x| x == 7));
    }
}
