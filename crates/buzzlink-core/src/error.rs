//! 故障分类
//!
//! 异步故障只在组件边界处理，并以状态字符串的形式对外呈现；
//! [`Fault`] 的 `Display` 就是对应的状态文本。

use crate::ble::{GattStatus, ResolutionFailure};
use crate::platform::Permission;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    /// 可再次提示，不致命
    #[error("Permissions denied: {}", join(.0))]
    PermissionDenied(Vec<Permission>),

    /// 致命：进程生命周期内禁用写入路径
    #[error("Bluetooth not supported on this device")]
    AdapterUnavailable,

    #[error("Please enable Bluetooth")]
    AdapterDisabled,

    /// 允许重新手动触发，不自动重试
    #[error("ESP32 device not found - Check if device is on and nearby")]
    ScanTimeout,

    #[error("{}", link_message(*.0))]
    LinkError(GattStatus),

    /// 保持连接，不重试
    #[error(transparent)]
    Resolution(#[from] ResolutionFailure),

    #[error("{0}")]
    WriteRejected(String),
}

impl Fault {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Fault::AdapterUnavailable)
    }

    /// 是否触发自动重连
    pub fn is_retryable(&self) -> bool {
        matches!(self, Fault::LinkError(status) if status.is_retryable())
    }
}

fn join(permissions: &[Permission]) -> String {
    permissions
        .iter()
        .map(|p| p.name())
        .collect::<Vec<_>>()
        .join(", ")
}

fn link_message(status: GattStatus) -> String {
    match status {
        GattStatus::GATT_ERROR => "Connection error 133 - Try restarting Bluetooth".to_string(),
        GattStatus::CONNECTION_TIMEOUT => {
            "Connection timeout - Device may be out of range".to_string()
        }
        other => format!("Disconnected (status: {other})"),
    }
}
