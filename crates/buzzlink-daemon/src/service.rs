//! 通知转发服务
//!
//! 监听会话总线上的桌面通知，来源合格时触发一次振动；
//! 同时把控制器的状态变化写入日志。
//! 总线连接失败或通知流中断时按指数退避重连，不会结束守护进程。

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use buzzlink_core::notify::{Action, EventForwarder, NotificationMonitor};
use buzzlink_core::{AppSettings, ControllerHandle};

const RETRY_MIN: Duration = Duration::from_secs(5);
const RETRY_MAX: Duration = Duration::from_secs(300);

pub async fn run_service(controller: ControllerHandle, settings: AppSettings) {
    tokio::spawn(log_status(controller.clone()));

    if !settings.forward_in_daemon {
        tracing::info!("守护进程内通知转发已关闭");
        return;
    }

    let forwarder = EventForwarder::new(&settings.notification_sources);
    tracing::info!(
        "通知转发已启用，来源: {}",
        settings.notification_sources.join(", ")
    );

    supervise(|| forward(&controller, &forwarder)).await;
}

/// 反复运行监听会话，失败后等待递增的间隔
async fn supervise<F, Fut>(mut session: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut delay = RETRY_MIN;
    loop {
        match session().await {
            Ok(()) => {
                tracing::warn!("D-Bus 通知流已关闭，{:?} 后重连", RETRY_MIN);
                delay = RETRY_MIN;
            }
            Err(e) => tracing::error!("通知监听失败: {:#}，{:?} 后重试", e, delay),
        }
        tokio::time::sleep(delay).await;
        delay = next_delay(delay);
    }
}

fn next_delay(delay: Duration) -> Duration {
    (delay * 2).min(RETRY_MAX)
}

async fn forward(controller: &ControllerHandle, forwarder: &EventForwarder) -> Result<()> {
    let mut monitor = NotificationMonitor::connect().await?;
    tracing::info!("已连接 D-Bus 通知监听");
    while let Some(event) = monitor.next().await {
        let Some(action) = forwarder.forward(&event) else {
            continue;
        };
        tracing::info!("来自 {} 的通知，触发 {}", event.source, action.name());
        match action {
            Action::Vibrate => match controller.vibrate().await {
                Ok(outcome) => tracing::debug!("振动请求结果: {:?}", outcome),
                Err(e) => tracing::warn!("振动请求被拒绝: {}", e),
            },
        }
    }
    Ok(())
}

async fn log_status(controller: ControllerHandle) {
    let mut snapshots = controller.subscribe();
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        tracing::info!("[{}] {}", snapshot.state, snapshot.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_next_delay_is_capped() {
        assert_eq!(next_delay(RETRY_MIN), Duration::from_secs(10));
        assert_eq!(next_delay(Duration::from_secs(200)), RETRY_MAX);
        assert_eq!(next_delay(RETRY_MAX), RETRY_MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_monitor_keeps_retrying() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let task = tokio::spawn(supervise(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("session bus unavailable")) }
        }));

        // 0s, 5s, 15s, 35s 各尝试一次
        tokio::time::sleep(Duration::from_secs(36)).await;
        assert!(!task.is_finished());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_stream_resets_delay() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let task = tokio::spawn(supervise(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(anyhow::anyhow!("session bus unavailable"))
                } else {
                    Ok(())
                }
            }
        }));

        // 失败后等 5s，之后流每次关闭都只等 5s 而非继续翻倍
        tokio::time::sleep(Duration::from_secs(5 + 5 + 5 + 1)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        task.abort();
    }
}
