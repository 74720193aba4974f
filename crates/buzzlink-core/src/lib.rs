//! Buzzlink Core Library
//!
//! 通过 BLE 向 ESP32 振动马达外设发送命令的中心端实现
//!
//! # 模块
//!
//! - **ble**: 扫描匹配、连接管理、GATT 解析与写入、btleplug 适配器
//! - **platform**: 权限与适配器开关状态
//! - **workflow**: 纯状态机与驱动它的控制器任务
//! - **notify**: 桌面通知监听与转发
//! - **ipc**: 守护进程与 CLI 之间的协议
//!
//! # 使用示例
//!
//! ```ignore
//! use buzzlink_core::{AppSettings, BleClient, BluezPlatform, Controller};
//!
//! let settings = AppSettings::load();
//! let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
//! let adapter = BleClient::new(events_tx).await;
//! let platform = Arc::new(BluezPlatform::default());
//!
//! let (handle, _task) =
//!     Controller::spawn(adapter, events_rx, platform, settings.controller_config());
//! handle.initialize()?;
//! handle.vibrate().await?;
//! ```

pub mod ble;
pub mod config;
pub mod effect;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod notify;
pub mod platform;
pub mod workflow;

// BLE re-exports
pub use ble::{
    BleAdapter, BleClient, CHARACTERISTIC_UUID, Command, ConnectionState, DeviceId,
    SERVICE_UUID, TargetIdentity,
};

pub use config::AppSettings;
pub use error::Fault;
pub use notify::{EventForwarder, NotificationEvent, VIBRATE_ACTION};
pub use platform::{BluezPlatform, Permission, Platform, PlatformStatus};
pub use workflow::{Controller, ControllerHandle, DispatchError, SendOutcome, Snapshot};
