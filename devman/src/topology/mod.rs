//! 设备间高速互联拓扑。
//!
//! 拓扑由设备管理库而不是计算驱动提供，库在运行时动态加载，不可用时由调用者决定如何处理。

mod nvml;

pub use nvml::{Nvml, NvmlDevice};

use crate::{Device, LinkMask};
use common::{DriverError, ErrorCode};
use log::{debug, warn};
use std::ptr::eq;

/// 每个设备检查的互联链路数。
pub const MAX_LINKS: u32 = 6;

/// 链路能力。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum LinkCapability {
    P2pSupported = 0,
    SysmemAccess = 1,
    P2pAtomics = 2,
    SysmemAtomics = 3,
    SliBridge = 4,
    Valid = 5,
}

/// 拓扑查询接口。
pub trait TopologyProvider {
    /// 库内的设备句柄。
    type Device: Copy;

    fn driver_version(&self) -> Result<String, ErrorCode>;
    fn device_by_index(&self, index: usize) -> Result<Self::Device, DriverError>;
    fn device_by_bus_id(&self, bus_id: &str) -> Result<Self::Device, DriverError>;
    fn bus_id(&self, device: Self::Device) -> Result<String, DriverError>;
    fn link_capability(
        &self,
        device: Self::Device,
        link: u32,
        capability: LinkCapability,
    ) -> Result<bool, DriverError>;
    fn link_active(&self, device: Self::Device, link: u32) -> Result<bool, DriverError>;
    /// 链路对端设备的总线地址。
    fn remote_bus_id(&self, device: Self::Device, link: u32) -> Result<String, DriverError>;
}

/// 重建每个设备的连接掩码。
///
/// 对每个设备的每条链路，支持点对点且处于激活状态时，按对端总线地址在其他设备中查找对端，
/// 找到后在本设备的掩码中置位对端序号。单个设备或链路的查询失败只会跳过它。
pub fn discover_links<P: TopologyProvider>(provider: &P, devices: &[Device]) {
    for dev in devices {
        dev.params().link_mask.clear()
    }

    let bus_ids = devices
        .iter()
        .map(|dev| {
            let id = provider
                .device_by_index(dev.index())
                .and_then(|handle| provider.bus_id(handle));
            if let Err(e) = &id {
                warn!("Device[{}]: bus id unavailable: {e}", dev.index())
            }
            id.ok()
        })
        .collect::<Vec<_>>();

    for dev in devices {
        let handle = match provider.device_by_index(dev.index()) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Device[{}]: no topology handle: {e}", dev.index());
                continue;
            }
        };
        for link in 0..MAX_LINKS {
            if !matches!(
                provider.link_capability(handle, link, LinkCapability::P2pSupported),
                Ok(true)
            ) || !matches!(provider.link_active(handle, link), Ok(true))
            {
                continue;
            }
            let Ok(remote) = provider.remote_bus_id(handle, link) else {
                continue;
            };
            let peer = devices
                .iter()
                .zip(&bus_ids)
                .find(|(peer, id)| !eq(*peer, dev) && id.as_deref() == Some(&*remote));
            if let Some((peer, _)) = peer {
                if !LinkMask::fits(peer.index()) {
                    warn!(
                        "Device[{}] link {link}: peer Device[{}] does not fit in a link mask",
                        dev.index(),
                        peer.index(),
                    );
                    continue;
                }
                debug!(
                    "Device[{}] link {link} -> Device[{}] ({remote})",
                    dev.index(),
                    peer.index(),
                );
                dev.params().link_mask.insert(peer.index())
            }
        }
    }
}

/// 加载设备管理库并重建所有设备的连接掩码。
pub fn query_nvlink(devices: &[Device]) -> Result<(), ErrorCode> {
    let nvml = Nvml::load()?;
    discover_links(&nvml, devices);
    Ok(())
}

/// 查询驱动版本。
pub fn driver_version() -> Result<String, ErrorCode> {
    Nvml::load()?.driver_version()
}
