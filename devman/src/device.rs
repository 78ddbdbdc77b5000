use crate::{handle::common_cpu::HostProgram, MAX_GROUP_SIZE};
use common::{DriverError, DriverResult};
use log::warn;
use std::{
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU32, Ordering::Relaxed},
        Arc, RwLock,
    },
    thread::available_parallelism,
};

#[cfg(use_cuda)]
use crate::handle::cuda;

/// 设备能力信息，发现设备时填写，之后只有连接掩码会被拓扑查询修改。
///
/// 整数字段以 -1 表示未知。
#[derive(Clone, Debug)]
pub struct DeviceParams {
    pub name: String,
    /// 显存总量（字节）。
    pub memory: usize,
    /// 每个线程块可用的共享内存（字节）。
    pub shared_mem_per_block: usize,
    pub cc_major: i32,
    pub cc_minor: i32,
    pub warp_size: i32,
    pub multiprocessor_count: i32,
    pub max_threads_per_block: i32,
    pub max_threads_per_mp: i32,
    pub dev_id: i32,
    pub bus_id: i32,
    pub driver_mode: DriverMode,
    /// 时钟频率（kHz）。
    pub clock_rate: i32,
    pub link_mask: LinkMask,
}

impl Default for DeviceParams {
    fn default() -> Self {
        Self {
            name: "Unknown".into(),
            memory: 0,
            shared_mem_per_block: 0,
            cc_major: -1,
            cc_minor: -1,
            warp_size: -1,
            multiprocessor_count: -1,
            max_threads_per_block: -1,
            max_threads_per_mp: -1,
            dev_id: -1,
            bus_id: -1,
            driver_mode: DriverMode::Unknown,
            clock_rate: -1,
            link_mask: LinkMask::default(),
        }
    }
}

impl DeviceParams {
    /// 所有整数字段都已填写。
    pub fn is_complete(&self) -> bool {
        [
            self.cc_major,
            self.cc_minor,
            self.warp_size,
            self.multiprocessor_count,
            self.max_threads_per_block,
            self.max_threads_per_mp,
            self.dev_id,
            self.bus_id,
            self.clock_rate,
        ]
        .iter()
        .all(|&x| x != -1)
    }
}

/// 驱动工作模式。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DriverMode {
    /// 与显示共享（WDDM）。
    Shared,
    /// 计算独占（TCC）。
    Exclusive,
    Unknown,
}

impl DriverMode {
    pub fn from_raw(value: i32) -> Self {
        match value {
            0 => Self::Shared,
            1 => Self::Exclusive,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for DriverMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Shared => "WDDM",
            Self::Exclusive => "TCC",
            Self::Unknown => "Unknown",
        })
    }
}

/// 高速互联的邻接集合，第 `j` 位表示与设备 `j` 直连。
///
/// 只能记录序号小于 32 的设备。
#[derive(Default, Debug)]
pub struct LinkMask(AtomicU32);

impl Clone for LinkMask {
    #[inline]
    fn clone(&self) -> Self {
        Self(AtomicU32::new(self.get()))
    }
}

impl LinkMask {
    #[inline]
    pub fn get(&self) -> u32 {
        self.0.load(Relaxed)
    }

    /// 序号为 `index` 的设备能否记录在掩码中。
    #[inline]
    pub const fn fits(index: usize) -> bool {
        index < u32::BITS as usize
    }

    /// # Panics
    ///
    /// `index` 不能记录在掩码中。
    #[inline]
    pub fn insert(&self, index: usize) {
        assert!(Self::fits(index), "device index {index} out of mask");
        self.0.fetch_or(1 << index, Relaxed);
    }

    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        Self::fits(index) && self.get() & (1 << index) != 0
    }

    #[inline]
    pub fn clear(&self) {
        self.0.store(0, Relaxed)
    }
}

#[derive(Clone)]
pub(crate) enum Program {
    Host(Arc<HostProgram>),
    #[cfg(use_cuda)]
    Device(Arc<cuda::Module>),
}

pub(crate) enum Backend {
    Emulated,
    #[cfg(use_cuda)]
    Cuda(cuda::Context),
}

/// 一个算力设备：能力信息、执行上下文和已加载的程序。
pub struct Device {
    params: DeviceParams,
    // 程序依赖上下文，必须先于上下文释放
    program: RwLock<Option<Program>>,
    backend: Backend,
}

impl Device {
    /// 用 CPU 模拟的设备。
    pub fn emulator(index: usize) -> Self {
        let threads = available_parallelism().map_or(1, |n| n.get());
        Self {
            params: DeviceParams {
                name: "Emulator".into(),
                memory: usize::MAX,
                warp_size: 1,
                multiprocessor_count: threads as _,
                max_threads_per_block: MAX_GROUP_SIZE as _,
                max_threads_per_mp: MAX_GROUP_SIZE as _,
                dev_id: index as _,
                ..Default::default()
            },
            program: RwLock::new(None),
            backend: Backend::Emulated,
        }
    }

    /// 查询第 `index` 个设备的能力信息并为它创建上下文。
    ///
    /// `emulate` 为真时只查询信息，存储和执行都放在宿主机上。
    #[cfg(use_cuda)]
    pub(crate) fn query(index: usize, emulate: bool) -> DriverResult<Self> {
        use ::cuda::bindings::CUdevice_attribute as Attr;

        let dev = cuda::device(index)?;
        let attr = |a| cuda::attribute(dev, a);
        let params = DeviceParams {
            name: cuda::name(dev)?,
            max_threads_per_block: attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)?,
            shared_mem_per_block: attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK)?
                as _,
            warp_size: attr(Attr::CU_DEVICE_ATTRIBUTE_WARP_SIZE)?,
            clock_rate: attr(Attr::CU_DEVICE_ATTRIBUTE_CLOCK_RATE)?,
            cc_major: attr(Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?,
            cc_minor: attr(Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?,
            max_threads_per_mp: attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_MULTIPROCESSOR)?,
            multiprocessor_count: attr(Attr::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)?,
            bus_id: attr(Attr::CU_DEVICE_ATTRIBUTE_PCI_BUS_ID)?,
            driver_mode: DriverMode::from_raw(attr(Attr::CU_DEVICE_ATTRIBUTE_TCC_DRIVER)?),
            memory: cuda::total_mem(dev)?,
            dev_id: index as _,
            link_mask: LinkMask::default(),
        };
        let backend = if emulate {
            Backend::Emulated
        } else {
            Backend::Cuda(cuda::Context::new(dev)?)
        };
        Ok(Self {
            params,
            program: RwLock::new(None),
            backend,
        })
    }

    #[inline]
    pub fn params(&self) -> &DeviceParams {
        &self.params
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.params.dev_id as _
    }

    #[inline]
    pub fn is_emulator(&self) -> bool {
        matches!(self.backend, Backend::Emulated)
    }

    #[inline]
    pub fn has_program(&self) -> bool {
        self.program.read().unwrap().is_some()
    }

    #[inline]
    pub(crate) fn program(&self) -> Option<Program> {
        self.program.read().unwrap().clone()
    }

    #[inline]
    pub(crate) fn backend(&self) -> &Backend {
        &self.backend
    }

    /// 把编译好的设备程序加载到设备上下文中。
    ///
    /// 加载失败时返回驱动的结果码，原先加载的程序保持不变。
    pub fn set_source(&self, image: &[u8]) -> DriverResult {
        match &self.backend {
            Backend::Emulated => {
                warn!(
                    "Device[{}] is emulated and cannot load a {}-byte device binary",
                    self.params.dev_id,
                    image.len(),
                );
                Err(DriverError::NOT_SUPPORTED)
            }
            #[cfg(use_cuda)]
            Backend::Cuda(ctx) => {
                let module = cuda::Module::load(ctx, image)?;
                *self.program.write().unwrap() = Some(Program::Device(Arc::new(module)));
                Ok(())
            }
        }
    }

    /// 为模拟设备设置宿主机程序。
    pub fn set_host_program(&self, program: HostProgram) -> DriverResult {
        if !self.is_emulator() {
            warn!(
                "Device[{}] is not emulated, host programs cannot run on it",
                self.params.dev_id,
            );
            return Err(DriverError::NOT_SUPPORTED);
        }
        *self.program.write().unwrap() = Some(Program::Host(Arc::new(program)));
        Ok(())
    }

    /// 使设备上下文成为调用线程的当前上下文，已经是当前上下文时不做任何事。
    pub fn make_current(&self) -> DriverResult {
        match &self.backend {
            Backend::Emulated => Ok(()),
            #[cfg(use_cuda)]
            Backend::Cuda(ctx) => ctx.make_current(),
        }
    }

    /// 在守卫的作用域内使设备上下文成为当前上下文。
    pub fn push_current(&self) -> DriverResult<ContextGuard> {
        Ok(ContextGuard {
            #[cfg(use_cuda)]
            _pushed: match &self.backend {
                Backend::Emulated => None,
                Backend::Cuda(ctx) => Some(ctx.push()?),
            },
            _marker: PhantomData,
        })
    }

    #[inline]
    pub fn info(&self) -> InfoFmt {
        InfoFmt(&self.params)
    }
}

/// 见 [`Device::push_current`]。
#[must_use]
pub struct ContextGuard<'a> {
    #[cfg(use_cuda)]
    _pushed: Option<cuda::Pushed>,
    _marker: PhantomData<(&'a Device, *const ())>,
}

pub struct InfoFmt<'a>(&'a DeviceParams);

impl fmt::Display for InfoFmt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let p = self.0;
        let total_memory = p.memory as f64 / (1 << 30) as f64;
        let shared_memory = p.shared_mem_per_block as f64 / (1 << 10) as f64;

        writeln!(f, "Device[{}] is : {}", p.dev_id, p.name)?;
        writeln!(f)?;
        writeln!(f, "\tDriver mode                    : {}", p.driver_mode)?;
        writeln!(f, "\tClock Rate                     : {}Mhz", p.clock_rate / 1000)?;
        writeln!(f, "\tTotal global memory            : {total_memory:.1} GB")?;
        writeln!(f, "\tShared memory                  : {shared_memory:.1} KB")?;
        writeln!(f, "\tCompute Capability             : {}.{}", p.cc_major, p.cc_minor)?;
        writeln!(f, "\tWarp size                      : {}", p.warp_size)?;
        writeln!(f, "\tMax threads per block          : {}", p.max_threads_per_block)?;
        writeln!(f, "\tMax threads per multiprocessor : {}", p.max_threads_per_mp)?;
        writeln!(f, "\tNumber of multiprocessors      : {}", p.multiprocessor_count)?;
        writeln!(f)
    }
}

#[cfg(test)]
mod test {
    use super::{Device, DeviceParams, DriverMode, LinkMask};
    use crate::HostProgram;
    use common::DriverError;

    #[test]
    fn test_info() {
        let dev = Device::emulator(0);
        let info = dev.info().to_string();
        println!("{info}");

        let mut lines = info.lines();
        assert_eq!(lines.next(), Some("Device[0] is : Emulator"));
        assert_eq!(lines.next(), Some(""));
        assert_eq!(
            lines.next(),
            Some("\tDriver mode                    : Unknown")
        );
        assert!(info.contains("\tWarp size                      : 1\n"));
        assert!(info.contains("\tMax threads per block          : 1024\n"));
        assert!(info.ends_with("\n\n"));
    }

    #[test]
    fn test_info_units() {
        let params = DeviceParams {
            name: "Test".into(),
            memory: 12 << 30,
            shared_mem_per_block: 48 << 10,
            clock_rate: 1_530_000,
            cc_major: 7,
            cc_minor: 0,
            driver_mode: DriverMode::Exclusive,
            ..Default::default()
        };
        let info = super::InfoFmt(&params).to_string();
        assert!(info.contains("Driver mode                    : TCC\n"));
        assert!(info.contains("Clock Rate                     : 1530Mhz\n"));
        assert!(info.contains("Total global memory            : 12.0 GB\n"));
        assert!(info.contains("Shared memory                  : 48.0 KB\n"));
        assert!(info.contains("Compute Capability             : 7.0\n"));
    }

    #[test]
    fn test_program() {
        let dev = Device::emulator(0);
        assert!(dev.is_emulator());
        assert!(!dev.has_program());
        assert_eq!(dev.set_source(b".version 7.0"), Err(DriverError::NOT_SUPPORTED));
        assert!(!dev.has_program());

        dev.set_host_program(HostProgram::new().define("noop", |_, _| {}))
            .unwrap();
        assert!(dev.has_program());
    }

    #[test]
    fn test_current() {
        let dev = Device::emulator(0);
        dev.make_current().unwrap();
        dev.make_current().unwrap();
        let guard = dev.push_current().unwrap();
        drop(guard);
    }

    #[test]
    fn test_sentinel() {
        assert!(!DeviceParams::default().is_complete());
        assert!(!Device::emulator(0).params().is_complete());
        assert_eq!(DriverMode::from_raw(0), DriverMode::Shared);
        assert_eq!(DriverMode::from_raw(7), DriverMode::Unknown);
    }

    #[test]
    fn test_link_mask() {
        let mask = LinkMask::default();
        assert_eq!(mask.get(), 0);
        mask.insert(1);
        mask.insert(3);
        mask.insert(1);
        assert_eq!(mask.get(), 0b1010);
        assert!(mask.contains(3));
        assert!(!mask.contains(0));
        assert!(!mask.contains(40));
        assert!(LinkMask::fits(31));
        assert!(!LinkMask::fits(32));
        assert_eq!(mask.clone().get(), 0b1010);
        mask.clear();
        assert_eq!(mask.get(), 0);
    }
}
