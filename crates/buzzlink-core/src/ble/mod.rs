pub mod adapter;
pub mod client;
pub mod connection;
pub mod gatt;
pub mod mock;
pub mod scanner;

use std::collections::BTreeSet;
use std::fmt;

use btleplug::api::CharPropFlags;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

/// 固件广播名（精确匹配，忽略大小写）
pub const EXACT_NAME_PATTERN: &str = "ESP32-Motor";
/// 厂商通用前缀（宽松匹配）
pub const LOOSE_NAME_PATTERN: &str = "ESP";

pub const VIBRATE_COMMAND: &str = "vibrate";
pub const REQUESTED_MTU: u16 = 512;

/// 目标外设的身份信息
///
/// 进程生命周期内不可变，由 [`crate::config::AppSettings::identity`] 构造。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetIdentity {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub exact_name: String,
    pub loose_name: String,
}

impl Default for TargetIdentity {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID,
            characteristic_uuid: CHARACTERISTIC_UUID,
            exact_name: EXACT_NAME_PATTERN.to_string(),
            loose_name: LOOSE_NAME_PATTERN.to_string(),
        }
    }
}

/// 不透明的设备标识（Linux 上为 MAC 地址字符串）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 单次扫描回调产生的设备描述，匹配成功或扫描结束后即丢弃
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: Option<String>,
    pub service_uuids: BTreeSet<Uuid>,
    pub rssi: i16,
}

impl DeviceDescriptor {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown Device")
    }
}

/// GATT 连接句柄
///
/// 由适配器在 `connect` 时分配，只由连接管理器持有。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattHandle(u64);

impl GattHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharPropFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// 服务发现后解析到的目标特征
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCharacteristic {
    pub service_uuid: Uuid,
    pub uuid: Uuid,
    pub properties: CharPropFlags,
}

pub use adapter::{
    AdapterError, AdapterEvent, AdapterEventReceiver, AdapterEventSender, BleAdapter, GattStatus,
    LinkState, ScanFailure,
};
pub use client::BleClient;
pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionSession, ConnectionState,
    Readiness,
};
pub use gatt::{Command, ResolutionFailure, WriteKind, WriteRequest};
pub use mock::{AdapterCall, RecordingAdapter, SimulatedPeripheral};
pub use scanner::{AlreadyScanning, MatchKind, Scanner};
