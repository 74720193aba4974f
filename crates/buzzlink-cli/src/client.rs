//! IPC Client - 与守护进程通信

use anyhow::Result;
use buzzlink_core::ipc::{self, IpcRequest, IpcResponse, socket_path};

pub async fn send_request(request: IpcRequest) -> Result<IpcResponse> {
    let response = match ipc::request(&request).await {
        Ok(response) => response,
        Err(e) => {
            eprintln!("❌ 无法连接到守护进程 ({:?}): {}", socket_path(), e);
            eprintln!("   请确保 buzzlink-daemon 正在运行");
            eprintln!("   运行: cargo xtask dev 或 systemctl --user start buzzlink");
            return Err(e);
        }
    };

    match &response {
        IpcResponse::Ok { message } => println!("✅ {}", message),
        IpcResponse::Error { message } => eprintln!("❌ {}", message),
        IpcResponse::Status { .. } => {}
    }

    Ok(response)
}
