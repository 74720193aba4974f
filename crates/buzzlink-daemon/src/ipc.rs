//! IPC Server - Unix Domain Socket 通信

use std::sync::Arc;

use anyhow::Result;
use buzzlink_core::ipc::{IpcRequest, IpcResponse, read_line, socket_path, write_message};
use buzzlink_core::notify::Action;
use buzzlink_core::{ControllerHandle, SendOutcome};
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;

pub async fn run_ipc_server(controller: ControllerHandle, stop: Arc<Notify>) -> Result<()> {
    let path = socket_path();

    // 删除旧的 socket 文件
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path)?;
    tracing::info!("IPC 服务器已启动: {:?}", path);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let controller = controller.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, controller, stop).await {
                        tracing::debug!("客户端连接结束: {}", e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("接受连接失败: {}", e);
            }
        }
    }
}

async fn handle_client(stream: UnixStream, controller: ControllerHandle, stop: Arc<Notify>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    while let Some(line) = read_line(&mut reader).await? {
        let request: IpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                write_message(&mut writer, &IpcResponse::error(format!("Invalid request: {e}")))
                    .await?;
                continue;
            }
        };

        tracing::debug!("收到请求: {:?}", request);

        let stopping = request == IpcRequest::Stop;
        let response = respond(&controller, request).await;
        write_message(&mut writer, &response).await?;

        if stopping {
            stop.notify_one();
            break;
        }
    }

    Ok(())
}

async fn respond(controller: &ControllerHandle, request: IpcRequest) -> IpcResponse {
    match request {
        IpcRequest::Status => IpcResponse::Status {
            snapshot: controller.snapshot(),
        },
        IpcRequest::Vibrate => vibrate(controller).await,
        IpcRequest::Action { name } => match Action::from_name(&name) {
            Some(Action::Vibrate) => vibrate(controller).await,
            None => IpcResponse::error(format!("Unknown action: {name}")),
        },
        IpcRequest::Disconnect => match controller.disconnect() {
            Ok(()) => IpcResponse::ok("Disconnecting..."),
            Err(e) => IpcResponse::error(e.to_string()),
        },
        IpcRequest::Stop => {
            tracing::info!("停止守护进程");
            IpcResponse::ok("已停止")
        }
    }
}

async fn vibrate(controller: &ControllerHandle) -> IpcResponse {
    match controller.vibrate().await {
        Ok(SendOutcome::Writing) => IpcResponse::ok("Sending command..."),
        Ok(SendOutcome::Scanning) => {
            IpcResponse::ok("Scanning for ESP32 device... send again once connected")
        }
        Ok(SendOutcome::AlreadyInProgress) => IpcResponse::ok("Already scanning or connecting..."),
        Ok(SendOutcome::NotWritable) => IpcResponse::error("Characteristic not writable"),
        Err(e) => IpcResponse::error(e.to_string()),
    }
}
