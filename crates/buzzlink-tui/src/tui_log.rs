//! TUI 日志层
//!
//! 自定义 tracing Layer，将日志发送到 TUI 的日志面板。

use crate::app::AppEvent;
use buzzlink_core::logging::{LogEntry, LogLevel};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{Event, Subscriber};
use tracing_log::NormalizeEvent;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// 发送日志到 TUI 的 Layer
pub struct TuiLogLayer {
    tx: mpsc::Sender<AppEvent>,
}

impl TuiLogLayer {
    pub fn new(tx: mpsc::Sender<AppEvent>) -> Self {
        Self { tx }
    }
}

impl<S> Layer<S> for TuiLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // log crate 桥接过来的事件要取原始的 target
        let normalized = event.normalized_metadata();
        let metadata = normalized.as_ref().unwrap_or_else(|| event.metadata());
        let level = LogLevel::from(tracing_log::AsLog::as_log(metadata.level()));

        // 提取日志消息
        let mut message = String::new();
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // 如果消息为空，使用目标名称
        if message.is_empty() {
            message = metadata.target().to_string();
        }

        // 尝试发送到 TUI（非阻塞）
        let entry = LogEntry::new(level, metadata.target(), message);
        let _ = self.tx.try_send(AppEvent::LogMessage(entry));
    }
}

/// 访问者，用于提取事件中的消息字段
struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            *self.0 = format!("{:?}", value);
        } else if self.0.is_empty() && !field.name().starts_with("log.") {
            // 如果还没有消息，使用第一个字段
            *self.0 = format!("{}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            *self.0 = value.to_string();
        } else if self.0.is_empty() && !field.name().starts_with("log.") {
            *self.0 = format!("{}={}", field.name(), value);
        }
    }
}
