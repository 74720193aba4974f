//! 权限与适配器门控
//!
//! 这里只有纯判定函数和一个很薄的 [`Platform`] 边界：
//! 分发器在每次触发前读取 [`PlatformStatus`]，据此决定继续、请求权限还是请求开启蓝牙。

pub mod bluez;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

pub use bluez::BluezPlatform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// 旧版蓝牙权限模型
    Bluetooth,
    BluetoothAdmin,
    /// 运行时蓝牙权限模型
    BluetoothScan,
    BluetoothConnect,
    FineLocation,
}

impl Permission {
    pub fn name(self) -> &'static str {
        match self {
            Permission::Bluetooth => "BLUETOOTH",
            Permission::BluetoothAdmin => "BLUETOOTH_ADMIN",
            Permission::BluetoothScan => "BLUETOOTH_SCAN",
            Permission::BluetoothConnect => "BLUETOOTH_CONNECT",
            Permission::FineLocation => "ACCESS_FINE_LOCATION",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 平台 API 级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlatformVersion(pub u32);

impl PlatformVersion {
    /// 从该级别起使用运行时蓝牙权限模型
    pub const RUNTIME_BLUETOOTH: PlatformVersion = PlatformVersion(31);

    pub fn uses_runtime_bluetooth(self) -> bool {
        self >= Self::RUNTIME_BLUETOOTH
    }
}

impl Default for PlatformVersion {
    fn default() -> Self {
        Self::RUNTIME_BLUETOOTH
    }
}

pub fn required_permissions(version: PlatformVersion) -> BTreeSet<Permission> {
    if version.uses_runtime_bluetooth() {
        BTreeSet::from([
            Permission::BluetoothScan,
            Permission::BluetoothConnect,
            Permission::FineLocation,
        ])
    } else {
        BTreeSet::from([
            Permission::Bluetooth,
            Permission::BluetoothAdmin,
            Permission::FineLocation,
        ])
    }
}

pub fn missing_permissions(
    version: PlatformVersion,
    granted: &BTreeSet<Permission>,
) -> Vec<Permission> {
    required_permissions(version)
        .into_iter()
        .filter(|p| !granted.contains(p))
        .collect()
}

/// 一次探测得到的平台状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformStatus {
    pub version: PlatformVersion,
    pub adapter_present: bool,
    pub adapter_powered: bool,
    pub granted: BTreeSet<Permission>,
}

impl PlatformStatus {
    /// 适配器存在、上电且权限齐全
    pub fn ready(version: PlatformVersion) -> Self {
        Self {
            version,
            adapter_present: true,
            adapter_powered: true,
            granted: required_permissions(version),
        }
    }

    pub fn without_adapter() -> Self {
        Self {
            version: PlatformVersion::default(),
            adapter_present: false,
            adapter_powered: false,
            granted: BTreeSet::new(),
        }
    }

    pub fn missing_permissions(&self) -> Vec<Permission> {
        missing_permissions(self.version, &self.granted)
    }

    pub fn has_required_permissions(&self) -> bool {
        self.missing_permissions().is_empty()
    }

    /// 缺少权限时无法观察开启状态，一律视为未开启
    pub fn is_adapter_enabled(&self) -> bool {
        if !self.has_required_permissions() {
            log::warn!("Cannot check Bluetooth enabled state - missing permissions");
            return false;
        }
        self.adapter_present && self.adapter_powered
    }
}

/// 权限请求结果：每个被请求的权限是否获准
pub type PermissionResult = BTreeMap<Permission, bool>;

/// 平台权限与适配器状态
#[async_trait::async_trait]
pub trait Platform: Send + Sync {
    async fn probe(&self) -> PlatformStatus;

    async fn request_permissions(&self, permissions: &[Permission]) -> PermissionResult;

    /// 返回用户（或系统）是否同意开启
    async fn request_enable(&self) -> bool;
}

/// 内存中的可配置平台，用于测试和无蓝牙环境的演示
#[derive(Debug, Clone)]
pub struct StaticPlatform {
    inner: Arc<Mutex<StaticState>>,
}

#[derive(Debug)]
struct StaticState {
    status: PlatformStatus,
    grant_on_request: bool,
    enable_on_request: bool,
}

impl StaticPlatform {
    pub fn new(status: PlatformStatus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StaticState {
                status,
                grant_on_request: true,
                enable_on_request: true,
            })),
        }
    }

    pub fn ready() -> Self {
        Self::new(PlatformStatus::ready(PlatformVersion::default()))
    }

    pub fn set_status(&self, status: PlatformStatus) {
        if let Ok(mut state) = self.inner.lock() {
            state.status = status;
        }
    }

    pub fn status(&self) -> PlatformStatus {
        self.inner
            .lock()
            .map(|s| s.status.clone())
            .unwrap_or_else(|_| PlatformStatus::without_adapter())
    }

    /// 之后的权限请求是否获准
    pub fn set_grant_on_request(&self, grant: bool) {
        if let Ok(mut state) = self.inner.lock() {
            state.grant_on_request = grant;
        }
    }

    pub fn set_enable_on_request(&self, enable: bool) {
        if let Ok(mut state) = self.inner.lock() {
            state.enable_on_request = enable;
        }
    }
}

#[async_trait::async_trait]
impl Platform for StaticPlatform {
    async fn probe(&self) -> PlatformStatus {
        self.status()
    }

    async fn request_permissions(&self, permissions: &[Permission]) -> PermissionResult {
        let Ok(mut state) = self.inner.lock() else {
            return permissions.iter().map(|p| (*p, false)).collect();
        };
        let grant = state.grant_on_request;
        if grant {
            state.status.granted.extend(permissions.iter().copied());
        }
        permissions.iter().map(|p| (*p, grant)).collect()
    }

    async fn request_enable(&self) -> bool {
        let Ok(mut state) = self.inner.lock() else {
            return false;
        };
        if state.enable_on_request && state.status.adapter_present {
            state.status.adapter_powered = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_permissions_by_version() {
        for level in [31, 33, 34] {
            assert_eq!(
                required_permissions(PlatformVersion(level)),
                BTreeSet::from([
                    Permission::BluetoothScan,
                    Permission::BluetoothConnect,
                    Permission::FineLocation
                ])
            );
        }
        for level in [21, 29, 30] {
            assert_eq!(
                required_permissions(PlatformVersion(level)),
                BTreeSet::from([
                    Permission::Bluetooth,
                    Permission::BluetoothAdmin,
                    Permission::FineLocation
                ])
            );
        }
    }

    #[test]
    fn test_missing_permissions() {
        let granted = BTreeSet::from([Permission::BluetoothScan, Permission::Bluetooth]);
        assert_eq!(
            missing_permissions(PlatformVersion(31), &granted),
            vec![Permission::BluetoothConnect, Permission::FineLocation]
        );
        assert_eq!(
            missing_permissions(PlatformVersion(30), &granted),
            vec![Permission::BluetoothAdmin, Permission::FineLocation]
        );
    }

    #[test]
    fn test_enabled_requires_permissions() {
        let mut status = PlatformStatus::ready(PlatformVersion(33));
        assert!(status.is_adapter_enabled());

        status.granted.remove(&Permission::FineLocation);
        assert!(status.adapter_powered);
        assert!(!status.is_adapter_enabled());

        let status = PlatformStatus::without_adapter();
        assert!(!status.is_adapter_enabled());
    }

    #[tokio::test]
    async fn test_static_platform_requests() {
        let mut status = PlatformStatus::ready(PlatformVersion(33));
        status.granted.clear();
        status.adapter_powered = false;
        let platform = StaticPlatform::new(status);

        let missing = platform.probe().await.missing_permissions();
        let result = platform.request_permissions(&missing).await;
        assert!(result.values().all(|granted| *granted));
        assert!(platform.probe().await.has_required_permissions());

        platform.set_enable_on_request(false);
        assert!(!platform.request_enable().await);
        platform.set_enable_on_request(true);
        assert!(platform.request_enable().await);
        assert!(platform.probe().await.is_adapter_enabled());
    }
}
