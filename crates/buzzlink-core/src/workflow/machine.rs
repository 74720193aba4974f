//! 纯状态机：组合扫描器、连接管理器和分发器
//!
//! 所有输入都经 [`Machine::handle`] 或 [`Machine::send`] 进入，输出副作用列表，
//! 不接触适配器和计时器，因此可以在没有蓝牙的环境下逐表测试。

use std::time::Duration;

use log::{debug, info, warn};

use crate::ble::{
    AdapterEvent, Command, ConnectionConfig, ConnectionEvent, ConnectionManager, ScanFailure,
    Scanner,
};
use crate::effect::{Effect, Timer, TimerKind};
use crate::error::Fault;
use crate::platform::{PermissionResult, PlatformStatus};
use crate::workflow::dispatcher::{self, DispatchError, InitDecision, SendOutcome};
use crate::workflow::Snapshot;

/// 控制器参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub connection: ConnectionConfig,
    pub scan_timeout: Duration,
    /// 初始化成功后立即开始扫描
    pub auto_connect: bool,
    /// `vibrate` 触发时发送的命令
    pub command: Command,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            scan_timeout: Duration::from_secs(15),
            auto_connect: false,
            command: Command::vibrate(),
        }
    }
}

/// 状态机输入
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Initialize,
    PermissionsResult(PermissionResult),
    EnableResult(bool),
    Disconnect,
    Adapter(AdapterEvent),
    Timer(Timer),
    /// `start_scan` 被适配器同步拒绝
    ScanRejected(ScanFailure),
    /// 适配器请求的同步结果
    Connection(ConnectionEvent),
}

#[derive(Debug)]
pub struct Machine {
    config: ControllerConfig,
    scanner: Scanner,
    connection: ConnectionManager,
    platform: PlatformStatus,
    status: String,
    write_disabled: bool,
}

impl Machine {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            scanner: Scanner::new(),
            connection: ConnectionManager::new(),
            platform: PlatformStatus::without_adapter(),
            status: "App started - Checking setup...".to_string(),
            write_disabled: false,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    /// 记录最近一次平台探测结果
    pub fn observe_platform(&mut self, status: PlatformStatus) {
        self.platform = status;
    }

    pub fn snapshot(&self) -> Snapshot {
        let session = self.connection.session();
        Snapshot {
            status: self.status.clone(),
            state: self.connection.state(),
            scanning: self.scanner.is_scanning(),
            device: session.map(|s| s.device.to_string()),
            device_name: session.map(|s| s.name.clone()),
            mtu_negotiated: session.is_some_and(|s| s.mtu_negotiated),
            reconnect_pending: self.connection.reconnect_pending(),
        }
    }

    /// 分发入口
    pub fn send(&mut self, command: &Command) -> (Result<SendOutcome, DispatchError>, Vec<Effect>) {
        debug!("send '{}' requested", command.text());

        if let Err(rejection) = dispatcher::check_send(&self.platform, self.write_disabled) {
            warn!("send rejected: {}", rejection.error);
            let effects = self.finish(rejection.effects);
            return (Err(rejection.error), effects);
        }

        if self.connection.is_ready() {
            let effects = self.connection.write(command);
            let outcome = if effects.iter().any(|e| matches!(e, Effect::Write { .. })) {
                SendOutcome::Writing
            } else {
                SendOutcome::NotWritable
            };
            return (Ok(outcome), self.finish(effects));
        }

        let (outcome, effects) = self.proceed_with_connection();
        (Ok(outcome), self.finish(effects))
    }

    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        let effects = match input {
            Input::Initialize => self.initialize(),
            Input::PermissionsResult(result) => match dispatcher::permission_result(&result) {
                Ok(()) => {
                    let mut effects = vec![Effect::status("Permissions granted")];
                    effects.extend(self.init_after_permissions());
                    effects
                }
                Err(fault) => {
                    warn!("CRITICAL: {}", fault);
                    vec![Effect::status(fault.to_string())]
                }
            },
            Input::EnableResult(true) => vec![Effect::status("Bluetooth enabled - Ready!")],
            Input::EnableResult(false) => vec![Effect::status("Bluetooth enable cancelled")],
            Input::Disconnect => {
                info!("Cleaning up resources...");
                let mut effects = self.scanner.stop();
                let scan_stopped = !effects.is_empty();
                effects.extend(self.step_connection(ConnectionEvent::Teardown));
                if scan_stopped && !effects.iter().any(|e| matches!(e, Effect::Status(_))) {
                    effects.push(Effect::status("Scan stopped"));
                }
                effects
            }
            Input::Adapter(event) => self.on_adapter_event(event),
            Input::Timer(timer) => self.on_timer(timer),
            Input::ScanRejected(failure) => self.scanner.on_failed(&failure),
            Input::Connection(event) => self.step_connection(event),
        };
        self.finish(effects)
    }

    fn initialize(&mut self) -> Vec<Effect> {
        match dispatcher::initialize(&self.platform) {
            InitDecision::Unsupported => {
                self.write_disabled = true;
                log::error!("Bluetooth not supported");
                vec![Effect::status(Fault::AdapterUnavailable.to_string())]
            }
            InitDecision::RequestPermissions(missing) => {
                debug!("Missing permissions, requesting...");
                vec![
                    Effect::status("Requesting permissions..."),
                    Effect::RequestPermissions(missing),
                ]
            }
            decision => {
                debug!("All permissions already granted");
                self.apply_ready(decision)
            }
        }
    }

    fn init_after_permissions(&mut self) -> Vec<Effect> {
        let decision = dispatcher::after_permissions(&self.platform);
        self.apply_ready(decision)
    }

    fn apply_ready(&mut self, decision: InitDecision) -> Vec<Effect> {
        match decision {
            InitDecision::Ready => {
                info!("Bluetooth is enabled and ready");
                let mut effects = vec![Effect::status("Ready to connect!")];
                if self.config.auto_connect {
                    effects.extend(self.proceed_with_connection().1);
                }
                effects
            }
            InitDecision::RequestEnable => vec![
                Effect::status(Fault::AdapterDisabled.to_string()),
                Effect::RequestEnable,
            ],
            InitDecision::Unsupported | InitDecision::RequestPermissions(_) => Vec::new(),
        }
    }

    fn proceed_with_connection(&mut self) -> (SendOutcome, Vec<Effect>) {
        if self.connection.state().is_busy() || self.scanner.is_scanning() {
            return (
                SendOutcome::AlreadyInProgress,
                vec![Effect::status("Already scanning or connecting...")],
            );
        }

        match self.scanner.start(self.config.scan_timeout) {
            Ok(effects) => {
                // 手动触发接管挂起的自动重连
                let mut all = self.step_connection(ConnectionEvent::Teardown);
                all.extend(effects);
                (SendOutcome::Scanning, all)
            }
            Err(e) => (
                SendOutcome::AlreadyInProgress,
                vec![Effect::status(format!("{e}..."))],
            ),
        }
    }

    fn on_adapter_event(&mut self, event: AdapterEvent) -> Vec<Effect> {
        match event {
            AdapterEvent::DeviceFound(device) => {
                let Some((_, mut effects)) =
                    self.scanner.on_device_found(&device, &self.config.connection.identity)
                else {
                    return Vec::new();
                };
                info!("TARGET DEVICE FOUND! Attempting connection...");
                effects.extend(self.step_connection(ConnectionEvent::Connect {
                    device: device.id.clone(),
                    name: device.display_name().to_string(),
                }));
                effects
            }
            AdapterEvent::ScanFailed(failure) => self.scanner.on_failed(&failure),
            AdapterEvent::LinkStateChanged {
                handle,
                status,
                state,
            } => self.step_connection(ConnectionEvent::Link {
                handle,
                status,
                state,
            }),
            AdapterEvent::MtuChanged {
                handle,
                mtu,
                status,
            } => self.step_connection(ConnectionEvent::MtuChanged {
                handle,
                mtu,
                status,
            }),
            AdapterEvent::ServicesDiscovered {
                handle,
                status,
                services,
            } => self.step_connection(ConnectionEvent::ServicesDiscovered {
                handle,
                status,
                services,
            }),
            AdapterEvent::CharacteristicWritten {
                handle,
                uuid,
                status,
            } => self.step_connection(ConnectionEvent::Written {
                handle,
                uuid,
                status,
            }),
        }
    }

    fn on_timer(&mut self, timer: Timer) -> Vec<Effect> {
        match timer.kind {
            TimerKind::ScanTimeout => {
                let Some(mut effects) = self.scanner.on_timeout(timer.epoch) else {
                    return Vec::new();
                };
                if !self.connection.state().is_busy() {
                    effects.push(Effect::status(Fault::ScanTimeout.to_string()));
                }
                effects
            }
            TimerKind::Settle
                if self.connection.awaits_settle(timer.epoch)
                    && !self.platform.has_required_permissions() =>
            {
                log::error!("Missing permissions for service discovery");
                vec![Effect::status("Missing permissions for service discovery")]
            }
            _ => self.step_connection(ConnectionEvent::Timer(timer)),
        }
    }

    fn step_connection(&mut self, event: ConnectionEvent) -> Vec<Effect> {
        let (next, effects) =
            std::mem::take(&mut self.connection).step(event, &self.config.connection);
        self.connection = next;
        effects
    }

    /// 记录最后一个状态字符串
    fn finish(&mut self, effects: Vec<Effect>) -> Vec<Effect> {
        if let Some(Effect::Status(status)) =
            effects.iter().rev().find(|e| matches!(e, Effect::Status(_)))
        {
            self.status = status.clone();
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{DeviceDescriptor, DeviceId, GattHandle, GattStatus, LinkState, SERVICE_UUID};
    use crate::platform::{Permission, PlatformVersion};
    use std::collections::BTreeSet;

    fn machine() -> Machine {
        let mut machine = Machine::new(ControllerConfig::default());
        machine.observe_platform(PlatformStatus::ready(PlatformVersion(33)));
        machine
    }

    fn found(name: &str, uuids: &[uuid::Uuid]) -> Input {
        Input::Adapter(AdapterEvent::DeviceFound(DeviceDescriptor {
            id: DeviceId::new("24:0A:C4:00:00:01"),
            name: Some(name.to_string()),
            service_uuids: uuids.iter().copied().collect::<BTreeSet<_>>(),
            rssi: -55,
        }))
    }

    #[test]
    fn test_send_starts_scan_once() {
        let mut m = machine();
        let (outcome, effects) = m.send(&Command::vibrate());
        assert_eq!(outcome, Ok(SendOutcome::Scanning));
        assert!(effects.contains(&Effect::StartScan));
        assert_eq!(m.status(), "Scanning for ESP32 device...");

        let (outcome, effects) = m.send(&Command::vibrate());
        assert_eq!(outcome, Ok(SendOutcome::AlreadyInProgress));
        assert!(!effects.contains(&Effect::StartScan));
        assert_eq!(m.status(), "Already scanning or connecting...");
    }

    #[test]
    fn test_uuid_match_connects() {
        let mut m = machine();
        m.send(&Command::vibrate());
        let effects = m.handle(found("Unknown", &[SERVICE_UUID]));
        assert!(effects.contains(&Effect::StopScan));
        assert!(effects.contains(&Effect::RefreshCache(DeviceId::new("24:0A:C4:00:00:01"))));
        assert_eq!(m.status(), "Connecting to Unknown...");
        assert!(!m.snapshot().scanning);
    }

    #[test]
    fn test_scan_timeout_status() {
        let mut m = machine();
        m.send(&Command::vibrate());
        let effects = m.handle(Input::Timer(Timer::new(TimerKind::ScanTimeout, 1)));
        assert!(effects.contains(&Effect::StopScan));
        assert_eq!(
            m.status(),
            "ESP32 device not found - Check if device is on and nearby"
        );
    }

    #[test]
    fn test_initialize_without_adapter_disables_writes() {
        let mut m = Machine::new(ControllerConfig::default());
        m.handle(Input::Initialize);
        assert_eq!(m.status(), "Bluetooth not supported on this device");

        // 之后即使探测到适配器，写入路径仍然禁用
        m.observe_platform(PlatformStatus::ready(PlatformVersion(33)));
        let (outcome, _) = m.send(&Command::vibrate());
        assert_eq!(outcome, Err(DispatchError::AdapterUnavailable));
    }

    #[test]
    fn test_permission_flow_resumes_initialization() {
        let mut m = Machine::new(ControllerConfig {
            auto_connect: true,
            ..ControllerConfig::default()
        });
        let mut status = PlatformStatus::ready(PlatformVersion(33));
        status.granted.clear();
        m.observe_platform(status);

        let effects = m.handle(Input::Initialize);
        assert!(effects.iter().any(|e| matches!(e, Effect::RequestPermissions(p) if p.len() == 3)));

        // 拒绝
        let denied = PermissionResult::from([(Permission::BluetoothScan, false)]);
        m.handle(Input::PermissionsResult(denied));
        assert_eq!(m.status(), "Permissions denied: BLUETOOTH_SCAN");

        // 获准后恢复初始化，而不是重放 send
        m.observe_platform(PlatformStatus::ready(PlatformVersion(33)));
        let granted = PermissionResult::from([(Permission::BluetoothScan, true)]);
        let effects = m.handle(Input::PermissionsResult(granted));
        assert!(effects.contains(&Effect::status("Permissions granted")));
        assert!(effects.contains(&Effect::StartScan));
    }

    /// 推进到已连接、等待服务发现的状态
    fn services_pending(m: &mut Machine) -> u64 {
        m.send(&Command::vibrate());
        m.handle(found("ESP32-Motor", &[]));
        m.handle(Input::Connection(ConnectionEvent::CacheRefreshed(Ok(()))));
        let epoch = m.connection().session().map(|s| s.epoch).unwrap();
        m.handle(Input::Timer(Timer::new(TimerKind::ConnectDelay, epoch)));
        m.handle(Input::Connection(ConnectionEvent::ConnectIssued(Ok(GattHandle::new(1)))));
        m.handle(Input::Adapter(AdapterEvent::LinkStateChanged {
            handle: GattHandle::new(1),
            status: GattStatus::SUCCESS,
            state: LinkState::Connected,
        }));
        assert!(m.connection().awaits_settle(epoch));
        epoch
    }

    #[test]
    fn test_settle_requires_permissions() {
        let mut m = machine();
        let epoch = services_pending(&mut m);
        let mut status = PlatformStatus::ready(PlatformVersion(33));
        status.granted.clear();
        m.observe_platform(status);
        let effects = m.handle(Input::Timer(Timer::new(TimerKind::Settle, epoch)));
        assert_eq!(
            effects,
            vec![Effect::status("Missing permissions for service discovery")]
        );
    }

    #[test]
    fn test_stale_settle_ignored_without_permissions() {
        let mut denied = PlatformStatus::ready(PlatformVersion(33));
        denied.granted.clear();

        let mut m = machine();
        m.observe_platform(denied.clone());
        let before = m.status().to_string();
        let effects = m.handle(Input::Timer(Timer::new(TimerKind::Settle, 42)));
        assert!(effects.is_empty());
        assert_eq!(m.status(), before);

        let mut m = machine();
        let epoch = services_pending(&mut m);
        m.observe_platform(denied);
        let before = m.status().to_string();
        let effects = m.handle(Input::Timer(Timer::new(TimerKind::Settle, epoch + 1)));
        assert!(effects.is_empty());
        assert_eq!(m.status(), before);
    }

    #[test]
    fn test_disconnect_while_scanning_reports_stop() {
        let mut m = machine();
        m.send(&Command::vibrate());
        assert!(m.snapshot().scanning);
        let effects = m.handle(Input::Disconnect);
        assert!(effects.contains(&Effect::StopScan));
        assert!(effects.contains(&Effect::status("Scan stopped")));
        assert_eq!(m.status(), "Scan stopped");
        assert!(!m.snapshot().scanning);
    }

    #[test]
    fn test_disconnect_when_idle_is_silent() {
        let mut m = machine();
        let effects = m.handle(Input::Disconnect);
        assert!(!effects.iter().any(|e| matches!(e, Effect::Status(_))));
    }
}
