//! Buzzlink Daemon
//!
//! 后台守护进程，负责：
//! - 持有唯一的 BLE 控制器
//! - 监听桌面通知并转发振动动作
//! - 通过 Unix Socket 与 CLI 通信

mod ipc;
mod service;

use std::sync::Arc;

use anyhow::{Result, anyhow};
use buzzlink_core::{AppSettings, BleClient, BluezPlatform, Controller};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（buzzlink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let settings = AppSettings::load();

    // 初始化日志
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_filter())),
        )
        .try_init();

    tracing::info!("Buzzlink Daemon starting...");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let adapter = BleClient::new(events_tx).await;
    if !adapter.has_adapter() {
        tracing::warn!("未找到蓝牙适配器，写入路径将被禁用");
    }
    let platform = Arc::new(BluezPlatform::new());
    let (controller, controller_task) =
        Controller::spawn(adapter, events_rx, platform, settings.controller_config());
    controller.initialize()?;

    let stop = Arc::new(Notify::new());

    // 启动 IPC 服务器
    let ipc_handle = tokio::spawn(ipc::run_ipc_server(controller.clone(), stop.clone()));

    // 启动通知转发，其失败只记录日志并在内部重试
    let service_handle = tokio::spawn(service::run_service(controller.clone(), settings));

    // 只有 IPC 退出或停止请求会结束守护进程
    let outcome = tokio::select! {
        res = ipc_handle => Err(ipc_exit(res)),
        () = stop.notified() => {
            tracing::info!("收到停止请求");
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("收到 Ctrl+C");
            Ok(())
        }
    };
    if let Err(e) = &outcome {
        tracing::error!("{:#}", e);
    }

    service_handle.abort();
    controller.shutdown().await;
    let _ = controller_task.await;
    let _ = std::fs::remove_file(buzzlink_core::ipc::socket_path());
    tracing::info!("Buzzlink Daemon stopped");

    outcome
}

/// IPC 服务器结束总是视为故障
fn ipc_exit(res: Result<Result<()>, JoinError>) -> anyhow::Error {
    match res {
        Ok(Ok(())) => anyhow!("IPC server exited unexpectedly"),
        Ok(Err(e)) => e.context("IPC server failed"),
        Err(e) => anyhow!("IPC server task aborted: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_exit_is_failure() {
        let err = ipc_exit(Ok(Ok(())));
        assert!(err.to_string().contains("exited unexpectedly"));

        let err = ipc_exit(Ok(Err(anyhow!("Address already in use"))));
        assert_eq!(format!("{err:#}"), "IPC server failed: Address already in use");
    }

    #[tokio::test]
    async fn test_aborted_ipc_task_is_failure() {
        let handle = tokio::spawn(std::future::pending::<Result<()>>());
        handle.abort();
        let err = ipc_exit(handle.await);
        assert!(err.to_string().starts_with("IPC server task aborted"));
    }
}
