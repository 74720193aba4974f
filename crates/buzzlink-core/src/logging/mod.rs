//! 日志模块
//!
//! 日志面板使用的级别、条目和定长缓冲区。

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// 日志级别，数值越小越严重
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn icon(&self) -> &'static str {
        match self {
            LogLevel::Error => "❌",
            LogLevel::Warn => "⚠️",
            LogLevel::Info => "ℹ️",
            LogLevel::Debug => "🔍",
            LogLevel::Trace => "📝",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    /// 面板中循环切换的下一个过滤级别
    pub fn next(self) -> Self {
        match self {
            LogLevel::Error => LogLevel::Warn,
            LogLevel::Warn => LogLevel::Info,
            LogLevel::Info => LogLevel::Debug,
            LogLevel::Debug => LogLevel::Trace,
            LogLevel::Trace => LogLevel::Error,
        }
    }
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => LogLevel::Error,
            log::Level::Warn => LogLevel::Warn,
            log::Level::Info => LogLevel::Info,
            log::Level::Debug => LogLevel::Debug,
            log::Level::Trace => LogLevel::Trace,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ();

    /// 无法识别的字符串按 `Info` 处理
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_uppercase().as_str() {
            "ERROR" => LogLevel::Error,
            "WARN" | "WARNING" => LogLevel::Warn,
            "DEBUG" => LogLevel::Debug,
            "TRACE" => LogLevel::Trace,
            _ => LogLevel::Info,
        })
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    /// 产生日志的模块路径
    pub target: String,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            target: target.into(),
            message: message.into(),
        }
    }
}

/// 定长日志缓冲区，写满后丢弃最旧的条目
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    filter: LogLevel,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            filter: LogLevel::Debug,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn filter(&self) -> LogLevel {
        self.filter
    }

    pub fn set_filter(&mut self, level: LogLevel) {
        self.filter = level;
    }

    /// 不比过滤级别更详细的条目，按时间顺序
    pub fn visible(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |e| e.level <= self.filter)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing_is_lenient() {
        assert_eq!("warn".parse(), Ok(LogLevel::Warn));
        assert_eq!(" Debug ".parse(), Ok(LogLevel::Debug));
        assert_eq!("verbose".parse(), Ok(LogLevel::Info));
        assert!(LogLevel::Error < LogLevel::Trace);
    }

    #[test]
    fn test_buffer_drops_oldest_and_filters() {
        let mut buffer = LogBuffer::new(2);
        buffer.push(LogEntry::new(LogLevel::Info, "a", "first"));
        buffer.push(LogEntry::new(LogLevel::Trace, "a", "second"));
        buffer.push(LogEntry::new(LogLevel::Error, "a", "third"));
        assert_eq!(buffer.len(), 2);

        let visible: Vec<_> = buffer.visible().map(|e| e.message.as_str()).collect();
        assert_eq!(visible, vec!["third"]);

        buffer.set_filter(LogLevel::Trace);
        assert_eq!(buffer.visible().count(), 2);
    }
}
