//! 通知转发
//!
//! 观察主机上的桌面通知，来源在配置集合内时发出具名动作，
//! 由持有控制器的进程把动作映射到 `send`。观察者和分发器可以在不同进程中。

pub mod dbus_monitor;

use std::collections::BTreeSet;

use log::debug;
use serde::{Deserialize, Serialize};

pub use dbus_monitor::NotificationMonitor;

/// 触发一次振动的具名动作
pub const VIBRATE_ACTION: &str = "buzzlink.BLUETOOTH_VIBRATE_ACTION";

/// 已知的具名动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Vibrate,
}

impl Action {
    pub fn name(self) -> &'static str {
        match self {
            Action::Vibrate => VIBRATE_ACTION,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        (name == VIBRATE_ACTION).then_some(Action::Vibrate)
    }
}

/// 一条桌面通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// 来源标识（发送通知的应用名）
    pub source: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct EventForwarder {
    sources: BTreeSet<String>,
}

impl EventForwarder {
    /// 来源按忽略大小写比较
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            sources: sources
                .into_iter()
                .map(|s| s.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn qualifies(&self, event: &NotificationEvent) -> bool {
        self.sources.contains(&event.source.to_lowercase())
    }

    /// 合格的通知映射为具名动作
    pub fn forward(&self, event: &NotificationEvent) -> Option<Action> {
        debug!(
            "Notification from {}: {} - {}",
            event.source, event.title, event.body
        );
        self.qualifies(event).then_some(Action::Vibrate)
    }
}
