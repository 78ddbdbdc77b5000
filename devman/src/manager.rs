use crate::{Device, ThreadData};
use common::{DeviceError, DriverResult};
use log::{info, warn};
use std::{fs, path::Path, sync::OnceLock};

/// 进程内的设备集合。
///
/// 由程序的组合根创建并显式初始化，再以引用传给需要设备的组件。
/// 需要全局访问时使用 [`DeviceManager::instance`]。
pub struct DeviceManager {
    initialized: bool,
    devices: Vec<Device>,
}

impl Default for DeviceManager {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceManager {
    /// 未初始化的空集合。
    #[inline]
    pub const fn new() -> Self {
        Self {
            initialized: false,
            devices: Vec::new(),
        }
    }

    /// 进程唯一的设备集合，首次访问时初始化。
    ///
    /// `emulation` 只在首次调用时生效，初始化的结果也会被记住。
    pub fn instance(emulation: bool) -> DriverResult<&'static Self> {
        static INSTANCE: OnceLock<DriverResult<DeviceManager>> = OnceLock::new();
        INSTANCE
            .get_or_init(|| {
                let mut manager = Self::new();
                manager.init(emulation).map(|()| manager)
            })
            .as_ref()
            .map_err(|&e| e)
    }

    /// 发现设备并为每个设备创建上下文，已经初始化时不做任何事。
    ///
    /// 驱动不可用或者没有设备时回退到一个模拟设备。
    /// 查询某个设备出错时整个初始化失败，已经查询到的设备随之释放，可以再次初始化。
    pub fn init(&mut self, emulation: bool) -> DriverResult {
        self.init_with(Self::driver_device_count(), |i| Self::query(i, emulation))
    }

    /// 驱动报告 `count` 个设备时逐个用 `query` 查询，全部成功才替换设备集合。
    fn init_with(
        &mut self,
        count: Option<usize>,
        query: impl FnMut(usize) -> DriverResult<Device>,
    ) -> DriverResult {
        if self.initialized {
            return Ok(());
        }
        self.devices = match count {
            Some(n) => (0..n).map(query).collect::<DriverResult<_>>()?,
            None => {
                warn!("no accelerator driver available, falling back to emulation");
                vec![Device::emulator(0)]
            }
        };
        self.initialized = true;
        info!("{} devices found", self.devices.len());
        Ok(())
    }

    #[cfg(use_cuda)]
    fn driver_device_count() -> Option<usize> {
        match crate::handle::cuda::init() {
            Ok(0) => None,
            Ok(n) => Some(n),
            Err(e) => {
                warn!("failed to initialize driver: {e}");
                None
            }
        }
    }

    #[cfg(not(use_cuda))]
    fn driver_device_count() -> Option<usize> {
        None
    }

    #[cfg(use_cuda)]
    #[inline]
    fn query(index: usize, emulation: bool) -> DriverResult<Device> {
        Device::query(index, emulation)
    }

    #[cfg(not(use_cuda))]
    #[inline]
    fn query(index: usize, _emulation: bool) -> DriverResult<Device> {
        Ok(Device::emulator(index))
    }

    /// 释放所有设备，之后可以重新初始化。
    pub fn deinit(&mut self) {
        self.devices.clear();
        self.initialized = false;
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[inline]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// # Panics
    ///
    /// `index` 越界。
    #[inline]
    pub fn device(&self, index: usize) -> &Device {
        let count = self.devices.len();
        self.devices
            .get(index)
            .unwrap_or_else(|| panic!("device index {index} out of range ({count} devices)"))
    }

    #[inline]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// 从文件读取编译好的设备程序并加载到每个设备上，加载前打印设备信息。
    pub fn init_devices(&self, program: impl AsRef<Path>) -> Result<(), DeviceError> {
        if self.devices.is_empty() {
            return Err(DeviceError::NoDevicesFound);
        }
        let program = program.as_ref();
        let image = match fs::read(program) {
            Ok(image) if !image.is_empty() => image,
            Ok(_) => {
                warn!("device program {} is empty", program.display());
                return Err(DeviceError::ProgramNotFound);
            }
            Err(e) => {
                warn!("failed to read device program {}: {e}", program.display());
                return Err(DeviceError::ProgramNotFound);
            }
        };
        for dev in &self.devices {
            info!("{}", dev.info());
            dev.set_source(&image)
                .map_err(DeviceError::InvalidProgram)?;
        }
        Ok(())
    }

    /// 创建 `n` 个执行线程，第 `i` 个绑定到第 `i % device_count` 个设备。
    pub fn init_thread_data(&self, n: usize) -> DriverResult<Vec<ThreadData>> {
        assert!(!self.devices.is_empty(), "device manager not initialized");
        (0..n)
            .map(|i| ThreadData::new(&self.devices[i % self.devices.len()]))
            .collect()
    }
}

impl Drop for DeviceManager {
    #[inline]
    fn drop(&mut self) {
        self.deinit()
    }
}

#[cfg(test)]
mod test {
    use super::DeviceManager;
    use crate::Device;
    use common::{DeviceError, DriverError};
    use std::{env::temp_dir, fs, ptr::eq};

    #[test]
    fn test_lifecycle() {
        let mut manager = DeviceManager::new();
        assert!(!manager.is_initialized());
        assert_eq!(manager.device_count(), 0);

        manager.init(true).unwrap();
        assert!(manager.is_initialized());
        let n = manager.device_count();
        assert!(n > 0);
        for (i, dev) in manager.devices().iter().enumerate() {
            assert_eq!(dev.index(), i);
            assert!(dev.is_emulator());
        }

        manager.init(false).unwrap();
        assert_eq!(manager.device_count(), n);

        manager.deinit();
        assert!(!manager.is_initialized());
        assert_eq!(manager.device_count(), 0);
    }

    #[test]
    fn test_failed_init_keeps_nothing() {
        let mut manager = DeviceManager::new();
        let failing = |i| {
            if i == 2 {
                Err(DriverError::INVALID_VALUE)
            } else {
                Ok(Device::emulator(i))
            }
        };
        assert_eq!(
            manager.init_with(Some(3), failing),
            Err(DriverError::INVALID_VALUE)
        );
        assert!(!manager.is_initialized());
        assert_eq!(manager.device_count(), 0);

        manager.init_with(Some(3), |i| Ok(Device::emulator(i))).unwrap();
        assert!(manager.is_initialized());
        let indices = manager.devices().iter().map(|d| d.index()).collect::<Vec<_>>();
        assert_eq!(indices, [0, 1, 2]);

        manager.init_with(Some(5), failing).unwrap();
        assert_eq!(manager.device_count(), 3);
    }

    #[test]
    fn test_real_devices() {
        let mut manager = DeviceManager::new();
        manager.init(false).unwrap();
        for (i, dev) in manager.devices().iter().enumerate() {
            if dev.is_emulator() {
                return;
            }
            println!("{}", dev.info());
            assert_eq!(dev.index(), i);
            assert!(dev.params().is_complete());
            assert!(dev.params().memory > 0);
        }
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range() {
        let mut manager = DeviceManager::new();
        manager.init(true).unwrap();
        let n = manager.device_count();
        let _ = manager.device(n);
    }

    #[test]
    fn test_instance() {
        let a = DeviceManager::instance(true).unwrap();
        let b = DeviceManager::instance(false).unwrap();
        assert!(eq(a, b));
        assert!(a.is_initialized());
    }

    #[test]
    fn test_thread_data() {
        let mut manager = DeviceManager::new();
        manager.init(true).unwrap();
        let n = manager.device_count();
        let threads = manager.init_thread_data(2 * n + 1).unwrap();
        assert_eq!(threads.len(), 2 * n + 1);
        for (i, td) in threads.iter().enumerate() {
            assert!(eq(td.device(), manager.device(i % n)));
        }
    }

    #[test]
    fn test_init_devices() {
        let mut manager = DeviceManager::new();
        assert_eq!(
            manager.init_devices("missing.ptx"),
            Err(DeviceError::NoDevicesFound)
        );
        manager.init(true).unwrap();

        let dir = temp_dir();
        assert_eq!(
            manager.init_devices(dir.join("devman-test-missing.ptx")),
            Err(DeviceError::ProgramNotFound)
        );

        let empty = dir.join(format!("devman-test-empty-{}.ptx", std::process::id()));
        fs::write(&empty, b"").unwrap();
        assert_eq!(
            manager.init_devices(&empty),
            Err(DeviceError::ProgramNotFound)
        );

        // 模拟设备拒绝加载设备程序
        let image = dir.join(format!("devman-test-image-{}.ptx", std::process::id()));
        fs::write(&image, b".version 7.0\n").unwrap();
        assert_eq!(
            manager.init_devices(&image),
            Err(DeviceError::InvalidProgram(DriverError::NOT_SUPPORTED))
        );

        let _ = fs::remove_file(empty);
        let _ = fs::remove_file(image);
    }
}
