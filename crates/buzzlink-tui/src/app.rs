//! Application state

use buzzlink_core::ble::Readiness;
use buzzlink_core::logging::{LogBuffer, LogEntry, LogLevel};
use buzzlink_core::{ConnectionState, ControllerHandle, SendOutcome, Snapshot};
use tokio::sync::{mpsc, watch};

const LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tab {
    Status,
    Log,
}

/// 后台任务送回界面的事件
#[derive(Debug)]
pub enum AppEvent {
    LogMessage(LogEntry),
    SendResult(String),
}

pub struct App {
    pub tab: Tab,
    pub snapshot: Snapshot,
    pub logs: LogBuffer,
    /// 最近一次 send 的同步结果
    pub last_send: Option<String>,
    pub sends: u32,
    pub event_tx: mpsc::Sender<AppEvent>,
    event_rx: mpsc::Receiver<AppEvent>,
    controller: ControllerHandle,
    snapshots: watch::Receiver<Snapshot>,
}

impl App {
    pub fn new(controller: ControllerHandle) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let snapshots = controller.subscribe();
        let mut logs = LogBuffer::new(LOG_CAPACITY);
        logs.push(LogEntry::new(LogLevel::Info, "buzzlink_tui", "Buzzlink TUI 启动"));
        logs.push(LogEntry::new(
            LogLevel::Info,
            "buzzlink_tui",
            "按 'v' 振动, 'x' 断开, 'q' 退出",
        ));
        Self {
            tab: Tab::Status,
            snapshot: controller.snapshot(),
            logs,
            last_send: None,
            sends: 0,
            event_tx,
            event_rx,
            controller,
            snapshots,
        }
    }

    pub fn controller(&self) -> &ControllerHandle {
        &self.controller
    }

    /// 触发一次振动，结果异步送回
    pub fn vibrate(&mut self) {
        self.sends += 1;
        let controller = self.controller.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let text = match controller.vibrate().await {
                Ok(SendOutcome::Writing) => "写入已发出".to_string(),
                Ok(SendOutcome::Scanning) => "开始扫描，连接后再按一次 'v'".to_string(),
                Ok(SendOutcome::AlreadyInProgress) => "扫描或连接进行中".to_string(),
                Ok(SendOutcome::NotWritable) => "特征不可写".to_string(),
                Err(e) => format!("被拒绝: {e}"),
            };
            let _ = tx.send(AppEvent::SendResult(text)).await;
        });
    }

    pub fn disconnect(&mut self) {
        if let Err(e) = self.controller.disconnect() {
            self.add_log(LogLevel::Error, e.to_string());
        }
    }

    pub fn add_log(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogEntry::new(level, "buzzlink_tui", message));
    }

    pub fn toggle_log_level(&mut self) {
        let next = self.logs.filter().next();
        self.logs.set_filter(next);
    }

    pub fn clear_logs(&mut self) {
        self.logs = LogBuffer::new(LOG_CAPACITY);
    }

    pub fn next_tab(&mut self) {
        self.tab = match self.tab {
            Tab::Status => Tab::Log,
            Tab::Log => Tab::Status,
        };
    }

    /// 连接进度 (0-100)
    pub fn progress(&self) -> u16 {
        match self.snapshot.state {
            ConnectionState::Connected(Readiness::Ready) => 100,
            ConnectionState::Connected(Readiness::ServicesPending) => 70,
            ConnectionState::Connecting => 40,
            ConnectionState::Idle if self.snapshot.scanning => 20,
            ConnectionState::Idle | ConnectionState::Disconnecting => 0,
        }
    }

    pub fn tick(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            match event {
                AppEvent::LogMessage(entry) => self.logs.push(entry),
                AppEvent::SendResult(text) => self.last_send = Some(text),
            }
        }
        if self.snapshots.has_changed().unwrap_or(false) {
            self.snapshot = self.snapshots.borrow_and_update().clone();
        }
    }
}
