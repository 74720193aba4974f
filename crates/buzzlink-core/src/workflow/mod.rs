//! 工作流模块
//!
//! 纯状态机 [`Machine`] 加上在单一 tokio 任务上驱动它的 [`Controller`]。

pub mod controller;
pub mod dispatcher;
pub mod machine;

use serde::{Deserialize, Serialize};

use crate::ble::ConnectionState;

pub use controller::{Controller, ControllerHandle};
pub use dispatcher::{DispatchError, SendOutcome};
pub use machine::{ControllerConfig, Input, Machine};

/// 对外状态面
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// 人类可读的状态字符串
    pub status: String,
    pub state: ConnectionState,
    pub scanning: bool,
    pub device: Option<String>,
    pub device_name: Option<String>,
    pub mtu_negotiated: bool,
    pub reconnect_pending: bool,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            status: "App started - Checking setup...".to_string(),
            state: ConnectionState::Idle,
            scanning: false,
            device: None,
            device_name: None,
            mtu_negotiated: false,
            reconnect_pending: false,
        }
    }
}
