//! 应用配置和持久化
//!
//! 目标外设身份、连接时序和通知来源的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::ble::{
    CHARACTERISTIC_UUID, Command, ConnectionConfig, EXACT_NAME_PATTERN, LOOSE_NAME_PATTERN,
    REQUESTED_MTU, SERVICE_UUID, TargetIdentity, VIBRATE_COMMAND,
};
use crate::workflow::ControllerConfig;

/// 应用设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 目标服务 UUID
    pub service_uuid: Uuid,
    /// 可写特征 UUID
    pub characteristic_uuid: Uuid,
    /// 固件广播名
    pub exact_name: String,
    /// 厂商前缀（宽松匹配）
    pub loose_name: String,
    /// 振动命令文本
    pub command: String,
    pub requested_mtu: u16,
    pub scan_timeout_ms: u64,
    pub connect_delay_ms: u64,
    pub settle_delay_ms: u64,
    pub reconnect_backoff_ms: u64,
    /// 触发振动的通知来源（应用名）
    pub notification_sources: Vec<String>,
    /// 由守护进程监听并转发通知；关闭后改用 `buzzlink listen`
    pub forward_in_daemon: bool,
    /// 启动后立即扫描连接
    pub auto_connect: bool,
    /// 详细日志模式
    pub verbose: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID,
            characteristic_uuid: CHARACTERISTIC_UUID,
            exact_name: EXACT_NAME_PATTERN.to_string(),
            loose_name: LOOSE_NAME_PATTERN.to_string(),
            command: VIBRATE_COMMAND.to_string(),
            requested_mtu: REQUESTED_MTU,
            scan_timeout_ms: 15_000,
            connect_delay_ms: 500,
            settle_delay_ms: 1_500,
            reconnect_backoff_ms: 3_000,
            notification_sources: vec![
                "WhatsApp".to_string(),
                "Messenger".to_string(),
                "Clocks".to_string(),
            ],
            forward_in_daemon: true,
            auto_connect: false,
            verbose: false,
        }
    }
}

impl AppSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("buzzlink");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn identity(&self) -> TargetIdentity {
        TargetIdentity {
            service_uuid: self.service_uuid,
            characteristic_uuid: self.characteristic_uuid,
            exact_name: self.exact_name.clone(),
            loose_name: self.loose_name.clone(),
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            identity: self.identity(),
            requested_mtu: self.requested_mtu,
            connect_delay: Duration::from_millis(self.connect_delay_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            connection: self.connection_config(),
            scan_timeout: Duration::from_millis(self.scan_timeout_ms),
            auto_connect: self.auto_connect,
            command: Command::new(self.command.clone()),
        }
    }

    /// 默认日志过滤规则
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info,buzzlink_core=debug"
        }
    }
}
