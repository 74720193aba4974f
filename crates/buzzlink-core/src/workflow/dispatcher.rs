//! 命令分发前置条件
//!
//! `send` 依次检查：适配器存在、权限齐全、蓝牙已开启、连接可写。
//! 前三项任一不满足都会同步失败；权限和开启请求的结果只会恢复初始化流程，
//! 不会重放这次 `send`。

use serde::{Deserialize, Serialize};

use crate::effect::Effect;
use crate::error::Fault;
use crate::platform::{Permission, PermissionResult, PlatformStatus};

/// `send` 同步返回的前置条件失败
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum DispatchError {
    #[error("Bluetooth not supported")]
    AdapterUnavailable,

    #[error("Missing Bluetooth permissions, requested: {}", .0.iter().map(|p| p.name()).collect::<Vec<_>>().join(", "))]
    PermissionsMissing(Vec<Permission>),

    #[error("Bluetooth disabled, enable requested")]
    AdapterDisabled,

    #[error("Controller is not running")]
    ControllerStopped,
}

/// `send` 通过前置条件后的去向，调用方不等待最终结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendOutcome {
    /// 已发出写请求
    Writing,
    /// 已连接但特征不可写，未发出写请求
    NotWritable,
    /// 已开始扫描
    Scanning,
    /// 已有扫描或连接在进行
    AlreadyInProgress,
}

/// 前置条件 1-3 的检查结果
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub error: DispatchError,
    pub effects: Vec<Effect>,
}

pub fn check_send(platform: &PlatformStatus, write_disabled: bool) -> Result<(), Rejection> {
    if write_disabled || !platform.adapter_present {
        return Err(Rejection {
            error: DispatchError::AdapterUnavailable,
            effects: vec![Effect::status("Bluetooth not supported")],
        });
    }

    let missing = platform.missing_permissions();
    if !missing.is_empty() {
        return Err(Rejection {
            error: DispatchError::PermissionsMissing(missing.clone()),
            effects: vec![
                Effect::status("Requesting BLE permissions..."),
                Effect::RequestPermissions(missing),
            ],
        });
    }

    if !platform.is_adapter_enabled() {
        return Err(Rejection {
            error: DispatchError::AdapterDisabled,
            effects: vec![
                Effect::status("Bluetooth disabled, requesting enable..."),
                Effect::RequestEnable,
            ],
        });
    }

    Ok(())
}

/// 初始化流程的决策
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitDecision {
    /// 写入路径在进程生命周期内禁用
    Unsupported,
    RequestPermissions(Vec<Permission>),
    RequestEnable,
    Ready,
}

pub fn initialize(platform: &PlatformStatus) -> InitDecision {
    if !platform.adapter_present {
        return InitDecision::Unsupported;
    }
    let missing = platform.missing_permissions();
    if !missing.is_empty() {
        return InitDecision::RequestPermissions(missing);
    }
    after_permissions(platform)
}

pub fn after_permissions(platform: &PlatformStatus) -> InitDecision {
    if platform.is_adapter_enabled() {
        InitDecision::Ready
    } else {
        InitDecision::RequestEnable
    }
}

/// 权限请求回调：全部获准才恢复初始化
pub fn permission_result(result: &PermissionResult) -> Result<(), Fault> {
    let denied: Vec<Permission> = result
        .iter()
        .filter(|(_, granted)| !**granted)
        .map(|(p, _)| *p)
        .collect();
    if denied.is_empty() {
        Ok(())
    } else {
        Err(Fault::PermissionDenied(denied))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformVersion;

    fn ready() -> PlatformStatus {
        PlatformStatus::ready(PlatformVersion(33))
    }

    #[test]
    fn test_precondition_order() {
        // 适配器缺失优先于一切
        let mut status = PlatformStatus::without_adapter();
        let rejection = check_send(&status, false).unwrap_err();
        assert_eq!(rejection.error, DispatchError::AdapterUnavailable);

        // 权限缺失优先于未开启
        status = ready();
        status.adapter_powered = false;
        status.granted.remove(&Permission::BluetoothConnect);
        let rejection = check_send(&status, false).unwrap_err();
        assert_eq!(
            rejection.error,
            DispatchError::PermissionsMissing(vec![Permission::BluetoothConnect])
        );
        assert!(rejection
            .effects
            .contains(&Effect::RequestPermissions(vec![Permission::BluetoothConnect])));

        status = ready();
        status.adapter_powered = false;
        let rejection = check_send(&status, false).unwrap_err();
        assert_eq!(rejection.error, DispatchError::AdapterDisabled);
        assert!(rejection.effects.contains(&Effect::RequestEnable));

        assert!(check_send(&ready(), false).is_ok());
        assert_eq!(
            check_send(&ready(), true).unwrap_err().error,
            DispatchError::AdapterUnavailable
        );
    }

    #[test]
    fn test_initialize_paths() {
        assert_eq!(
            initialize(&PlatformStatus::without_adapter()),
            InitDecision::Unsupported
        );

        let mut status = ready();
        status.granted.clear();
        assert!(matches!(
            initialize(&status),
            InitDecision::RequestPermissions(p) if p.len() == 3
        ));

        let mut status = ready();
        status.adapter_powered = false;
        assert_eq!(initialize(&status), InitDecision::RequestEnable);
        assert_eq!(initialize(&ready()), InitDecision::Ready);
    }

    #[test]
    fn test_permission_result() {
        let all = PermissionResult::from([
            (Permission::BluetoothScan, true),
            (Permission::BluetoothConnect, true),
        ]);
        assert!(permission_result(&all).is_ok());

        let partial = PermissionResult::from([
            (Permission::BluetoothScan, true),
            (Permission::FineLocation, false),
        ]);
        assert_eq!(
            permission_result(&partial),
            Err(Fault::PermissionDenied(vec![Permission::FineLocation]))
        );
    }
}
