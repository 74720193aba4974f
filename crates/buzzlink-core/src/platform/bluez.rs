//! BlueZ 平台探测
//!
//! Linux 上没有逐项授权的蓝牙权限：能打开 BlueZ D-Bus 会话即视为全部获准。
//! 会话首次成功打开后缓存复用，打开失败时下次探测重试。

use std::collections::BTreeSet;

use log::{debug, info, warn};
use tokio::sync::OnceCell;

use super::{
    Permission, PermissionResult, Platform, PlatformStatus, PlatformVersion,
    required_permissions,
};

pub struct BluezPlatform {
    version: PlatformVersion,
    session: OnceCell<bluer::Session>,
}

impl BluezPlatform {
    pub fn new() -> Self {
        Self {
            version: PlatformVersion::default(),
            session: OnceCell::new(),
        }
    }

    async fn session(&self) -> bluer::Result<&bluer::Session> {
        self.session.get_or_try_init(bluer::Session::new).await
    }

    async fn default_adapter(&self) -> bluer::Result<bluer::Adapter> {
        self.session().await?.default_adapter().await
    }
}

impl Default for BluezPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Platform for BluezPlatform {
    async fn probe(&self) -> PlatformStatus {
        let session = match self.session().await {
            Ok(session) => session,
            Err(e) => {
                warn!("Cannot open BlueZ session: {}", e);
                return PlatformStatus {
                    version: self.version,
                    adapter_present: true,
                    adapter_powered: false,
                    granted: BTreeSet::new(),
                };
            }
        };

        let granted = required_permissions(self.version);
        let adapter = match session.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("No Bluetooth adapter: {}", e);
                return PlatformStatus {
                    version: self.version,
                    adapter_present: false,
                    adapter_powered: false,
                    granted,
                };
            }
        };

        let powered = adapter.is_powered().await.unwrap_or(false);
        debug!("Adapter '{}' powered: {}", adapter.name(), powered);
        PlatformStatus {
            version: self.version,
            adapter_present: true,
            adapter_powered: powered,
            granted,
        }
    }

    async fn request_permissions(&self, permissions: &[Permission]) -> PermissionResult {
        let granted = self.session().await.is_ok();
        if !granted {
            warn!("BlueZ session still unavailable, permissions denied");
        }
        permissions.iter().map(|p| (*p, granted)).collect()
    }

    async fn request_enable(&self) -> bool {
        let adapter = match self.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("Cannot enable Bluetooth: {}", e);
                return false;
            }
        };

        info!("Powering on adapter '{}'", adapter.name());
        match adapter.set_powered(true).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to power on adapter: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_opened_lazily() {
        let platform = BluezPlatform::new();
        assert!(!platform.session.initialized());
        assert_eq!(platform.version, PlatformVersion::default());
    }
}
