//! BLE 适配器边界
//!
//! 平台蓝牙栈只需提供扫描、连接、MTU 协商、服务发现和写入这几个原语。
//! 所有请求都是"发出即返回"：方法本身只报告请求是否被接受，
//! 结果稍后以 [`AdapterEvent`] 的形式送回控制器。

use std::fmt;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ble::{DeviceDescriptor, DeviceId, GattHandle, ResolvedCharacteristic, ServiceInfo};
use crate::ble::gatt::WriteRequest;

/// GATT 状态码（与链路层错误码一致）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    /// 连接超时
    pub const CONNECTION_TIMEOUT: GattStatus = GattStatus(8);
    /// 通用 GATT 失败
    pub const GATT_ERROR: GattStatus = GattStatus(133);
    pub const FAILURE: GattStatus = GattStatus(257);

    /// 可自动重连的断开原因
    pub const RETRYABLE: [GattStatus; 2] = [GattStatus::GATT_ERROR, GattStatus::CONNECTION_TIMEOUT];

    pub fn is_success(self) -> bool {
        self == GattStatus::SUCCESS
    }

    pub fn is_retryable(self) -> bool {
        GattStatus::RETRYABLE.contains(&self)
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// 扫描失败原因，数值与平台扫描回调的错误码一致
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanFailure {
    #[error("Scan already started")]
    AlreadyStarted,

    #[error("App registration failed")]
    RegistrationFailed,

    #[error("Feature unsupported")]
    FeatureUnsupported,

    #[error("Internal error")]
    InternalError,

    #[error("Unknown error: {0}")]
    Other(i32),
}

impl ScanFailure {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ScanFailure::AlreadyStarted,
            2 => ScanFailure::RegistrationFailed,
            3 => ScanFailure::FeatureUnsupported,
            4 => ScanFailure::InternalError,
            other => ScanFailure::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ScanFailure::AlreadyStarted => 1,
            ScanFailure::RegistrationFailed => 2,
            ScanFailure::FeatureUnsupported => 3,
            ScanFailure::InternalError => 4,
            ScanFailure::Other(code) => *code,
        }
    }
}

/// 适配器请求错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("No Bluetooth adapter available")]
    Unavailable,

    #[error("Operation not supported by this adapter")]
    Unsupported,

    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("Unknown connection handle")]
    UnknownHandle,

    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// 适配器异步完成事件
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    DeviceFound(DeviceDescriptor),
    ScanFailed(ScanFailure),
    LinkStateChanged {
        handle: GattHandle,
        status: GattStatus,
        state: LinkState,
    },
    MtuChanged {
        handle: GattHandle,
        mtu: u16,
        status: GattStatus,
    },
    ServicesDiscovered {
        handle: GattHandle,
        status: GattStatus,
        services: Vec<ServiceInfo>,
    },
    CharacteristicWritten {
        handle: GattHandle,
        uuid: Uuid,
        status: GattStatus,
    },
}

pub type AdapterEventSender = mpsc::UnboundedSender<AdapterEvent>;
pub type AdapterEventReceiver = mpsc::UnboundedReceiver<AdapterEvent>;

/// 平台 BLE 栈边界
///
/// 方法在控制器的所有者任务上同步调用，不得阻塞；
/// 耗时操作由实现自行派生任务，并通过构造时拿到的 [`AdapterEventSender`] 回报结果。
pub trait BleAdapter: Send {
    /// 无过滤的广播监听
    fn start_scan(&mut self) -> Result<(), ScanFailure>;

    fn stop_scan(&mut self);

    /// 清除设备的 GATT 服务缓存
    ///
    /// 这是可选能力，不支持时返回 [`AdapterError::Unsupported`]。
    fn refresh_cache(&mut self, device: &DeviceId) -> Result<(), AdapterError>;

    /// 按设备断开（缓存刷新失败后的回退路径）
    fn disconnect_device(&mut self, device: &DeviceId);

    fn connect(&mut self, device: &DeviceId) -> Result<GattHandle, AdapterError>;

    fn request_mtu(&mut self, handle: GattHandle, mtu: u16) -> Result<(), AdapterError>;

    fn discover_services(&mut self, handle: GattHandle) -> Result<(), AdapterError>;

    fn write(
        &mut self,
        handle: GattHandle,
        characteristic: &ResolvedCharacteristic,
        request: &WriteRequest,
    ) -> Result<(), AdapterError>;

    fn disconnect(&mut self, handle: GattHandle);

    /// 释放句柄，之后该句柄的事件都会被忽略
    fn close(&mut self, handle: GattHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(GattStatus(133).is_retryable());
        assert!(GattStatus(8).is_retryable());
        for code in [0, 1, 19, 22, 62, 257] {
            assert!(!GattStatus(code).is_retryable(), "status {code}");
        }
    }

    #[test]
    fn test_scan_failure_codes() {
        assert_eq!(ScanFailure::from_code(2), ScanFailure::RegistrationFailed);
        assert_eq!(ScanFailure::from_code(4).to_string(), "Internal error");
        assert_eq!(ScanFailure::from_code(9).to_string(), "Unknown error: 9");
        assert_eq!(ScanFailure::Other(9).code(), 9);
    }
}
