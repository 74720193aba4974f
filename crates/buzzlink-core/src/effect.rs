//! 状态机输出的副作用
//!
//! 扫描器、连接管理器和分发器都是纯状态转换，它们不直接调用适配器，
//! 而是返回 [`Effect`] 列表，由 [`crate::workflow::Controller`] 在唯一的
//! 所有者任务上依次执行。

use std::time::Duration;

use crate::ble::{DeviceId, GattHandle, ResolvedCharacteristic, WriteRequest};
use crate::platform::Permission;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    ScanTimeout,
    ConnectDelay,
    Settle,
    Reconnect,
}

/// 延迟定时器
///
/// `epoch` 是启动定时器的扫描/连接会话编号，触发时与当前会话比对，
/// 不一致则视为过期。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    pub kind: TimerKind,
    pub epoch: u64,
}

impl Timer {
    pub fn new(kind: TimerKind, epoch: u64) -> Self {
        Self { kind, epoch }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// 更新对外状态字符串
    Status(String),
    StartScan,
    StopScan,
    ArmTimer(Timer, Duration),
    CancelTimer(TimerKind),
    RefreshCache(DeviceId),
    /// 缓存刷新失败时的回退：按设备断开
    DisconnectDevice(DeviceId),
    Connect(DeviceId),
    RequestMtu(GattHandle, u16),
    DiscoverServices(GattHandle),
    Write {
        handle: GattHandle,
        characteristic: ResolvedCharacteristic,
        request: WriteRequest,
    },
    Disconnect(GattHandle),
    /// 释放连接句柄
    Close(GattHandle),
    RequestPermissions(Vec<Permission>),
    RequestEnable,
}

impl Effect {
    pub fn status(message: impl Into<String>) -> Self {
        Effect::Status(message.into())
    }
}
