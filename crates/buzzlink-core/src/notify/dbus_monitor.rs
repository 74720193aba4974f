//! D-Bus 通知监听
//!
//! 以监视者身份接入会话总线，截获发往通知守护进程的方法调用：
//! - `org.freedesktop.Notifications.Notify` (签名 `susssasa{sv}i`)
//! - `org.gtk.Notifications.AddNotification` (签名 `ssa{sv}`)

use std::collections::HashMap;

use anyhow::Result;
use futures_util::StreamExt;
use log::{debug, info, warn};
use zbus::message::{Message, Type};
use zbus::zvariant::OwnedValue;
use zbus::{Connection, MatchRule, MessageStream};

use super::NotificationEvent;

const FDO_INTERFACE: &str = "org.freedesktop.Notifications";
const GTK_INTERFACE: &str = "org.gtk.Notifications";

pub struct NotificationMonitor {
    stream: MessageStream,
    // 监视连接必须在流的整个生命周期内保持打开
    _connection: Connection,
}

impl NotificationMonitor {
    pub async fn connect() -> Result<Self> {
        let connection = Connection::session().await?;
        let monitoring = zbus::fdo::MonitoringProxy::new(&connection).await?;

        let rules = [
            MatchRule::builder()
                .msg_type(Type::MethodCall)
                .interface(FDO_INTERFACE)?
                .member("Notify")?
                .build(),
            MatchRule::builder()
                .msg_type(Type::MethodCall)
                .interface(GTK_INTERFACE)?
                .member("AddNotification")?
                .build(),
        ];
        monitoring.become_monitor(&rules, 0).await?;
        info!("D-Bus notification monitor active");

        let stream = MessageStream::from(&connection);
        Ok(Self {
            stream,
            _connection: connection,
        })
    }

    /// 等待下一条通知；总线连接关闭时返回 `None`
    pub async fn next(&mut self) -> Option<NotificationEvent> {
        while let Some(msg) = self.stream.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("D-Bus stream error: {}", e);
                    continue;
                }
            };
            if msg.message_type() != Type::MethodCall {
                continue;
            }
            match parse_notification(&msg) {
                Ok(Some(event)) => return Some(event),
                Ok(None) => {}
                Err(e) => debug!("Skipping malformed notification: {}", e),
            }
        }
        None
    }
}

fn parse_notification(msg: &Message) -> zbus::Result<Option<NotificationEvent>> {
    let header = msg.header();
    let interface = header.interface().map(|i| i.as_str()).unwrap_or("");
    let member = header.member().map(|m| m.as_str()).unwrap_or("");

    match (interface, member) {
        (FDO_INTERFACE, "Notify") => {
            let (app_name, _replaces_id, _icon, summary, body, _actions, _hints, _timeout): (
                String,
                u32,
                String,
                String,
                String,
                Vec<String>,
                HashMap<String, OwnedValue>,
                i32,
            ) = msg.body().deserialize()?;
            Ok(Some(NotificationEvent {
                source: app_name,
                title: summary,
                body,
            }))
        }
        (GTK_INTERFACE, "AddNotification") => {
            let (app_id, _id, properties): (String, String, HashMap<String, OwnedValue>) =
                msg.body().deserialize()?;
            let text = |key: &str| {
                properties
                    .get(key)
                    .and_then(|v| <&str>::try_from(v).ok())
                    .map(str::to_owned)
                    .unwrap_or_default()
            };
            Ok(Some(NotificationEvent {
                title: text("title"),
                body: text("body"),
                source: app_id,
            }))
        }
        _ => Ok(None),
    }
}
