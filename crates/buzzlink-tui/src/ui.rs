//! UI rendering module

use buzzlink_core::ConnectionState;
use buzzlink_core::logging::LogLevel;
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Gauge, List, ListItem, Paragraph, Tabs, Wrap},
};

use crate::app::{App, Tab};

pub fn draw(frame: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(10),   // Main content
            Constraint::Length(3), // Status bar
        ])
        .split(frame.area());

    draw_header(frame, app, chunks[0]);
    draw_main(frame, app, chunks[1]);
    draw_status_bar(frame, app, chunks[2]);
}

fn draw_header(frame: &mut Frame, app: &App, area: Rect) {
    let titles = vec!["状态 [1]", "日志 [2]"];
    let selected = match app.tab {
        Tab::Status => 0,
        Tab::Log => 1,
    };

    let tabs = Tabs::new(titles)
        .block(Block::default().borders(Borders::ALL).title(" Buzzlink TUI "))
        .select(selected)
        .style(Style::default().fg(Color::White))
        .highlight_style(Style::default().fg(Color::Yellow).bold());

    frame.render_widget(tabs, area);
}

fn draw_main(frame: &mut Frame, app: &App, area: Rect) {
    match app.tab {
        Tab::Status => draw_status_tab(frame, app, area),
        Tab::Log => draw_log_tab(frame, app, area),
    }
}

fn draw_status_tab(frame: &mut Frame, app: &App, area: Rect) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(5), // Status line
            Constraint::Length(3), // Progress
            Constraint::Min(5),    // Details
        ])
        .split(area);

    let snapshot = &app.snapshot;
    let status = Paragraph::new(snapshot.status.as_str())
        .style(Style::default().fg(state_color(snapshot.state)).bold())
        .block(Block::default().borders(Borders::ALL).title(" 📡 状态 "))
        .wrap(Wrap { trim: true });
    frame.render_widget(status, rows[0]);

    let progress = app.progress();
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" 连接进度 "))
        .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
        .percent(progress)
        .label(snapshot.state.to_string());
    frame.render_widget(gauge, rows[1]);

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(rows[2]);

    let device = match (&snapshot.device_name, &snapshot.device) {
        (Some(name), Some(address)) => format!("{name} ({address})"),
        _ => "--".to_string(),
    };
    let lines = vec![
        Line::from(format!("设备: {device}")),
        Line::from(format!(
            "MTU: {}",
            if snapshot.mtu_negotiated { "已协商" } else { "默认" }
        )),
        Line::from(format!(
            "扫描: {}",
            if snapshot.scanning { "进行中" } else { "--" }
        )),
        Line::from(format!(
            "自动重连: {}",
            if snapshot.reconnect_pending { "等待中" } else { "--" }
        )),
        Line::from(""),
        Line::from(format!(
            "上次发送 (#{}): {}",
            app.sends,
            app.last_send.as_deref().unwrap_or("--")
        )),
    ];
    let details =
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(" 连接 "));
    frame.render_widget(details, columns[0]);

    let help_text = "v / Enter 振动\nx 断开连接\nTab 切换标签\nd 切换日志级别\nc 清空日志\nq 退出";
    let help = Paragraph::new(help_text)
        .block(Block::default().borders(Borders::ALL).title(" 帮助 "))
        .wrap(Wrap { trim: true });
    frame.render_widget(help, columns[1]);
}

fn draw_log_tab(frame: &mut Frame, app: &App, area: Rect) {
    let height = area.height.saturating_sub(2) as usize;
    let visible: Vec<_> = app.logs.visible().collect();
    let items: Vec<ListItem> = visible
        .iter()
        .rev()
        .take(height)
        .map(|entry| {
            let style = match entry.level {
                LogLevel::Error => Style::default().fg(Color::Red),
                LogLevel::Warn => Style::default().fg(Color::Yellow),
                LogLevel::Info => Style::default(),
                LogLevel::Debug | LogLevel::Trace => Style::default().fg(Color::DarkGray),
            };
            ListItem::new(format!("{} {}", entry.level.icon(), entry.message)).style(style)
        })
        .collect();

    let title = format!(" 📋 日志 (≤ {}) ", app.logs.filter());
    let list = List::new(items).block(Block::default().borders(Borders::ALL).title(title));

    frame.render_widget(list, area);
}

fn draw_status_bar(frame: &mut Frame, app: &App, area: Rect) {
    let mode_text = match app.snapshot.state {
        ConnectionState::Idle if app.snapshot.scanning => " 🔍 扫描中 ",
        ConnectionState::Idle => " ⏸️  空闲 ",
        ConnectionState::Connecting => " 🔗 连接中 ",
        ConnectionState::Connected(_) if app.snapshot.state.is_ready() => " ✅ 就绪 ",
        ConnectionState::Connected(_) => " 🔎 发现服务 ",
        ConnectionState::Disconnecting => " ⏏️  断开中 ",
    };

    let status = Paragraph::new(format!(
        "{}│ 日志: {} │ [v]振动 [x]断开 [Tab]切换 [q]退出",
        mode_text,
        app.logs.len()
    ))
    .block(Block::default().borders(Borders::ALL));

    frame.render_widget(status, area);
}

fn state_color(state: ConnectionState) -> Color {
    match state {
        ConnectionState::Connected(_) if state.is_ready() => Color::Green,
        ConnectionState::Connected(_) | ConnectionState::Connecting => Color::Yellow,
        ConnectionState::Idle | ConnectionState::Disconnecting => Color::White,
    }
}
