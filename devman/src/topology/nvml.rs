use super::{LinkCapability, TopologyProvider};
use common::{DriverError, ErrorCode};
use libloading::Library;
use log::info;
use std::{
    ffi::{c_char, c_int, c_uint, c_void, CString},
    ptr::null_mut,
};

#[cfg(windows)]
const LIBRARY_PATHS: &[&str] = &[
    "nvml.dll",
    "C:/Program Files/NVIDIA Corporation/NVSMI/nvml.dll",
    "C:/Windows/System32/nvml.dll",
];
#[cfg(not(windows))]
const LIBRARY_PATHS: &[&str] = &["libnvidia-ml.so.1", "libnvidia-ml.so"];

const SUCCESS: c_int = 0;
const ERROR_NO_PERMISSION: c_int = 4;
const ERROR_DRIVER_NOT_LOADED: c_int = 9;
const FEATURE_ENABLED: c_uint = 1;

/// 设备管理库中的设备句柄。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct NvmlDevice(*mut c_void);

// 只读取总线地址，其余字段仅用于保持布局
#[allow(dead_code)]
#[repr(C)]
struct PciInfo {
    bus_id_legacy: [c_char; 16],
    domain: c_uint,
    bus: c_uint,
    device: c_uint,
    pci_device_id: c_uint,
    pci_sub_system_id: c_uint,
    bus_id: [c_char; 32],
}

impl PciInfo {
    const fn zeroed() -> Self {
        Self {
            bus_id_legacy: [0; 16],
            domain: 0,
            bus: 0,
            device: 0,
            pci_device_id: 0,
            pci_sub_system_id: 0,
            bus_id: [0; 32],
        }
    }

    /// `domain:bus:device.function` 形式的短地址。
    fn legacy_bus_id(&self) -> String {
        to_string(&self.bus_id_legacy)
    }
}

fn to_string(chars: &[c_char]) -> String {
    let bytes = chars
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect::<Vec<_>>();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[inline]
fn nvml_result(code: c_int) -> Result<(), DriverError> {
    if code == SUCCESS {
        Ok(())
    } else {
        Err(DriverError(code))
    }
}

type InitFn = unsafe extern "C" fn() -> c_int;
type ShutdownFn = unsafe extern "C" fn() -> c_int;
type DriverVersionFn = unsafe extern "C" fn(*mut c_char, c_uint) -> c_int;
type HandleByIndexFn = unsafe extern "C" fn(c_uint, *mut NvmlDevice) -> c_int;
type HandleByBusIdFn = unsafe extern "C" fn(*const c_char, *mut NvmlDevice) -> c_int;
type PciInfoFn = unsafe extern "C" fn(NvmlDevice, *mut PciInfo) -> c_int;
type LinkCapabilityFn = unsafe extern "C" fn(NvmlDevice, c_uint, c_uint, *mut c_uint) -> c_int;
type LinkStateFn = unsafe extern "C" fn(NvmlDevice, c_uint, *mut c_uint) -> c_int;
type RemotePciInfoFn = unsafe extern "C" fn(NvmlDevice, c_uint, *mut PciInfo) -> c_int;

/// 运行时加载并初始化的 NVML，释放时关闭。
pub struct Nvml {
    shutdown: ShutdownFn,
    driver_version: DriverVersionFn,
    handle_by_index: HandleByIndexFn,
    handle_by_bus_id: HandleByBusIdFn,
    pci_info: PciInfoFn,
    link_capability: LinkCapabilityFn,
    link_state: LinkStateFn,
    remote_pci_info: RemotePciInfoFn,
    _lib: Library,
}

impl Nvml {
    /// 依次尝试已知的库路径，解析所有需要的符号并初始化库。
    pub fn load() -> Result<Self, ErrorCode> {
        const FUNCTION: &str = "Nvml::load";

        let lib = LIBRARY_PATHS
            .iter()
            .find_map(|path| unsafe { Library::new(path) }.ok())
            .ok_or_else(|| ErrorCode::new(FUNCTION, -1, "Failed to load NVML"))?;

        macro_rules! symbol {
            ($ty:ty, $name:literal) => {
                *unsafe { lib.get::<$ty>(concat!($name, "\0").as_bytes()) }.map_err(|e| {
                    ErrorCode::new(FUNCTION, -1, format!("Failed to load NVML: {}: {e}", $name))
                })?
            };
        }

        let init = symbol!(InitFn, "nvmlInit_v2");
        let shutdown = symbol!(ShutdownFn, "nvmlShutdown");
        let driver_version = symbol!(DriverVersionFn, "nvmlSystemGetDriverVersion");
        let handle_by_index = symbol!(HandleByIndexFn, "nvmlDeviceGetHandleByIndex_v2");
        let handle_by_bus_id = symbol!(HandleByBusIdFn, "nvmlDeviceGetHandleByPciBusId_v2");
        let pci_info = symbol!(PciInfoFn, "nvmlDeviceGetPciInfo_v3");
        let link_capability = symbol!(LinkCapabilityFn, "nvmlDeviceGetNvLinkCapability");
        let link_state = symbol!(LinkStateFn, "nvmlDeviceGetNvLinkState");
        let remote_pci_info = symbol!(RemotePciInfoFn, "nvmlDeviceGetNvLinkRemotePciInfo_v2");

        match unsafe { init() } {
            SUCCESS => {}
            e => {
                let message = match e {
                    ERROR_DRIVER_NOT_LOADED => {
                        "NVidia driver is not running. Initialization failed."
                    }
                    ERROR_NO_PERMISSION => "NVML does not have permission to talk to the driver.",
                    _ => "NVML encountered an unexpected error during initialization.",
                };
                return Err(ErrorCode::new("nvmlInit_v2", e, message));
            }
        }
        info!("NVML loaded");

        Ok(Self {
            shutdown,
            driver_version,
            handle_by_index,
            handle_by_bus_id,
            pci_info,
            link_capability,
            link_state,
            remote_pci_info,
            _lib: lib,
        })
    }
}

impl Drop for Nvml {
    #[inline]
    fn drop(&mut self) {
        let _ = unsafe { (self.shutdown)() };
    }
}

impl TopologyProvider for Nvml {
    type Device = NvmlDevice;

    fn driver_version(&self) -> Result<String, ErrorCode> {
        let mut version = [0 as c_char; 80];
        nvml_result(unsafe { (self.driver_version)(version.as_mut_ptr(), version.len() as _) })
            .map_err(|e| {
                ErrorCode::new(
                    "nvmlSystemGetDriverVersion",
                    e.code(),
                    "failed to query driver version",
                )
            })?;
        Ok(to_string(&version))
    }

    fn device_by_index(&self, index: usize) -> Result<NvmlDevice, DriverError> {
        let mut device = NvmlDevice(null_mut());
        nvml_result(unsafe { (self.handle_by_index)(index as _, &mut device) })?;
        Ok(device)
    }

    fn device_by_bus_id(&self, bus_id: &str) -> Result<NvmlDevice, DriverError> {
        let bus_id = CString::new(bus_id).map_err(|_| DriverError::INVALID_VALUE)?;
        let mut device = NvmlDevice(null_mut());
        nvml_result(unsafe { (self.handle_by_bus_id)(bus_id.as_ptr(), &mut device) })?;
        Ok(device)
    }

    fn bus_id(&self, device: NvmlDevice) -> Result<String, DriverError> {
        let mut pci = PciInfo::zeroed();
        nvml_result(unsafe { (self.pci_info)(device, &mut pci) })?;
        Ok(pci.legacy_bus_id())
    }

    fn link_capability(
        &self,
        device: NvmlDevice,
        link: u32,
        capability: LinkCapability,
    ) -> Result<bool, DriverError> {
        let mut result: c_uint = 0;
        nvml_result(unsafe { (self.link_capability)(device, link, capability as _, &mut result) })?;
        Ok(result != 0)
    }

    fn link_active(&self, device: NvmlDevice, link: u32) -> Result<bool, DriverError> {
        let mut state: c_uint = 0;
        nvml_result(unsafe { (self.link_state)(device, link, &mut state) })?;
        Ok(state == FEATURE_ENABLED)
    }

    fn remote_bus_id(&self, device: NvmlDevice, link: u32) -> Result<String, DriverError> {
        let mut pci = PciInfo::zeroed();
        nvml_result(unsafe { (self.remote_pci_info)(device, link, &mut pci) })?;
        Ok(pci.legacy_bus_id())
    }
}

#[cfg(test)]
mod test {
    use super::{nvml_result, to_string, Nvml, PciInfo};
    use crate::topology::TopologyProvider;
    use common::DriverError;
    use std::{ffi::c_char, mem::size_of};

    #[test]
    fn test_pci_info() {
        assert_eq!(size_of::<PciInfo>(), 16 + 5 * 4 + 32);

        let mut pci = PciInfo::zeroed();
        assert_eq!(pci.legacy_bus_id(), "");
        for (dst, &src) in pci.bus_id_legacy.iter_mut().zip(b"0000:3B:00.0\0xx") {
            *dst = src as c_char;
        }
        assert_eq!(pci.legacy_bus_id(), "0000:3B:00.0");
        assert_eq!(to_string(&[b'a' as c_char, b'b' as c_char]), "ab");
    }

    #[test]
    fn test_result() {
        assert_eq!(nvml_result(0), Ok(()));
        assert_eq!(nvml_result(3), Err(DriverError(3)));
    }

    #[test]
    fn test_load() {
        match Nvml::load() {
            Ok(nvml) => {
                let version = nvml.driver_version().unwrap();
                println!("driver version: {version}");
                assert!(!version.is_empty());
            }
            Err(e) => {
                println!("{e}");
                assert_ne!(e.code(), 0);
                assert!(e.message().contains("NV"));
            }
        }
    }
}
