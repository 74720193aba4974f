//! Buzzlink TUI - 交互式终端界面
//!
//! 在进程内运行控制器，用 ratatui 展示连接状态并触发振动。
//!
//! # 日志
//!
//! 日志默认显示在 TUI 的"日志"标签页中。
//! 如需输出到文件进行调试，设置 RUST_LOG 环境变量：
//!
//! ```bash
//! RUST_LOG=debug cargo run -p buzzlink-tui 2>> /tmp/buzzlink.log
//! ```

mod app;
mod tui_log;
mod ui;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use buzzlink_core::{AppSettings, BleClient, BluezPlatform, Controller};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::prelude::*;
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use app::App;
use tui_log::TuiLogLayer;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = AppSettings::load();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let adapter = BleClient::new(events_tx).await;
    let platform = Arc::new(BluezPlatform::new());
    let (controller, controller_task) =
        Controller::spawn(adapter, events_rx, platform, settings.controller_config());

    // 创建 App（获取日志发送器）
    let app = App::new(controller.clone());

    // 初始化日志系统，发送到 TUI 日志面板
    init_logging(app.event_tx.clone(), settings.log_filter());
    controller.initialize()?;

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Run app
    let res = run_app(&mut terminal, app).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    controller.shutdown().await;
    let _ = controller_task.await;

    res
}

/// 初始化日志系统
///
/// - 总是将日志发送到 TUI 日志面板
/// - 如果设置了 RUST_LOG，同时输出到 stderr（用于调试）
fn init_logging(log_tx: mpsc::Sender<app::AppEvent>, default_filter: &str) {
    // 桥接 log crate（buzzlink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    // TUI 日志层 - 总是启用
    let tui_layer = TuiLogLayer::new(log_tx);

    // 设置过滤器
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // 如果设置了 RUST_LOG，同时输出到 stderr
    if std::env::var("RUST_LOG").is_ok() {
        use tracing_subscriber::fmt;

        let stderr_layer = fmt::layer()
            .with_writer(io::stderr)
            .with_target(true)
            .compact();

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tui_layer)
            .with(stderr_layer)
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tui_layer)
            .try_init();
    }
}

async fn run_app<B: Backend>(terminal: &mut Terminal<B>, mut app: App) -> Result<()> {
    loop {
        terminal.draw(|f| ui::draw(f, &app))?;

        // 使用 poll 避免无限阻塞；poll 是同步调用，先让出给后台任务
        tokio::task::yield_now().await;
        if event::poll(Duration::from_millis(100))?
            && let Event::Key(key) = event::read()?
            && key.kind == KeyEventKind::Press
        {
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => {
                    return Ok(());
                }
                KeyCode::Char('v') | KeyCode::Enter => app.vibrate(),
                KeyCode::Char('x') => app.disconnect(),
                KeyCode::Char('i') => {
                    if let Err(e) = app.controller().initialize() {
                        app.add_log(buzzlink_core::logging::LogLevel::Error, e.to_string());
                    }
                }
                KeyCode::Tab => app.next_tab(),
                KeyCode::Char('1') => app.tab = app::Tab::Status,
                KeyCode::Char('2') => app.tab = app::Tab::Log,
                KeyCode::Char('d') => app.toggle_log_level(),
                KeyCode::Char('c') => app.clear_logs(),
                _ => {}
            }
        }

        // Update app state (handle async events)
        app.tick();
    }
}
