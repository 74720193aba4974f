//! Buzzlink CLI
//!
//! 命令行客户端，通过 Unix Socket 与守护进程通信

mod client;

use anyhow::Result;
use buzzlink_core::AppSettings;
use buzzlink_core::ipc::{IpcRequest, IpcResponse};
use buzzlink_core::notify::{EventForwarder, NotificationMonitor};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "buzzlink", version, about = "ESP32 振动马达 BLE 遥控")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 发送振动命令（未连接时先扫描连接）
    Vibrate,
    /// 查看连接状态
    Status,
    /// 断开当前连接
    Disconnect,
    /// 发送具名动作
    Action {
        /// 动作名，例如 buzzlink.BLUETOOTH_VIBRATE_ACTION
        name: String,
    },
    /// 监听桌面通知并转发给守护进程（需关闭 forward_in_daemon）
    Listen,
    /// 打印当前配置
    Config,
    /// 停止守护进程
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Vibrate => {
            println!("📳 发送振动命令");
            client::send_request(IpcRequest::Vibrate).await?;
        }
        Commands::Status => {
            let resp = client::send_request(IpcRequest::Status).await?;
            if let IpcResponse::Status { snapshot } = resp {
                println!("状态: {}", snapshot.status);
                println!("连接: {}", snapshot.state);
                if snapshot.scanning {
                    println!("扫描中...");
                }
                if let (Some(name), Some(address)) = (&snapshot.device_name, &snapshot.device) {
                    println!("设备: {} ({})", name, address);
                }
                if snapshot.mtu_negotiated {
                    println!("MTU: 已协商");
                }
                if snapshot.reconnect_pending {
                    println!("等待自动重连");
                }
            }
        }
        Commands::Disconnect => {
            client::send_request(IpcRequest::Disconnect).await?;
        }
        Commands::Action { name } => {
            client::send_request(IpcRequest::Action { name }).await?;
        }
        Commands::Listen => listen().await?,
        Commands::Config => {
            let settings = AppSettings::load();
            println!("# {}", AppSettings::config_path().display());
            print!("{}", toml::to_string_pretty(&settings)?);
        }
        Commands::Stop => {
            println!("⏹️  停止守护进程");
            client::send_request(IpcRequest::Stop).await?;
        }
    }

    Ok(())
}

async fn listen() -> Result<()> {
    let settings = AppSettings::load();
    if settings.forward_in_daemon {
        anyhow::bail!(
            "守护进程已在转发通知，重复监听会触发两次振动；如需改用本命令，请在配置中设置 forward_in_daemon = false"
        );
    }
    let forwarder = EventForwarder::new(&settings.notification_sources);
    println!(
        "👂 监听通知，来源: {}",
        settings.notification_sources.join(", ")
    );

    let mut monitor = NotificationMonitor::connect().await?;
    while let Some(event) = monitor.next().await {
        if let Some(action) = forwarder.forward(&event) {
            println!("🔔 {}: {}", event.source, event.title);
            // 守护进程暂时不可用时继续监听
            let _ = client::send_request(IpcRequest::Action {
                name: action.name().to_string(),
            })
            .await;
        }
    }
    Ok(())
}
