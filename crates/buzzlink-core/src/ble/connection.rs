//! GATT 连接生命周期
//!
//! ```text
//! Idle -> Connecting -> Connected(ServicesPending) -> Connected(Ready)
//!                                                   \-> Disconnecting -> Idle
//! ```
//!
//! [`ConnectionManager::step`] 是纯函数：接收当前值和一个事件，返回新值和需要执行的副作用。
//! 连接句柄和解析出的特征只存在于 [`ConnectionSession`] 中，断开时无条件清除。

use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ble::gatt::{self, Command};
use crate::ble::{
    AdapterError, DeviceId, GattHandle, GattStatus, LinkState, ResolvedCharacteristic,
    ServiceInfo, TargetIdentity,
};
use crate::effect::{Effect, Timer, TimerKind};
use crate::error::Fault;

/// 连接参数，由配置派生，进程生命周期内不变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub identity: TargetIdentity,
    pub requested_mtu: u16,
    /// 清缓存后到发起连接的延迟
    pub connect_delay: Duration,
    /// 链路建立后到 MTU 协商的稳定等待
    pub settle_delay: Duration,
    pub reconnect_backoff: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            identity: TargetIdentity::default(),
            requested_mtu: crate::ble::REQUESTED_MTU,
            connect_delay: Duration::from_millis(500),
            settle_delay: Duration::from_millis(1500),
            reconnect_backoff: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Readiness {
    ServicesPending,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "readiness")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected(Readiness),
    Disconnecting,
}

impl ConnectionState {
    pub fn is_ready(self) -> bool {
        self == ConnectionState::Connected(Readiness::Ready)
    }

    /// 处于该状态时不允许发起新的连接
    pub fn is_busy(self) -> bool {
        !matches!(self, ConnectionState::Idle)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "Idle"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected(Readiness::ServicesPending) => {
                write!(f, "Connected (services pending)")
            }
            ConnectionState::Connected(Readiness::Ready) => write!(f, "Connected (ready)"),
            ConnectionState::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// 连接建立阶段（仅在 `Connecting` 状态下有意义）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectPhase {
    ClearingCache { retried: bool },
    Delaying,
    Requested,
}

/// 服务发现阶段（仅在 `Connected(ServicesPending)` 状态下有意义）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiscoveryPhase {
    Settling,
    MtuRequested,
    Discovering,
    /// 发现已结束但未找到目标，保持连接但不可写
    Unresolved,
}

/// 当前连接会话
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSession {
    pub device: DeviceId,
    pub name: String,
    /// 会话编号，用于识别过期定时器
    pub epoch: u64,
    pub handle: Option<GattHandle>,
    pub characteristic: Option<ResolvedCharacteristic>,
    pub state: ConnectionState,
    pub mtu_negotiated: bool,
    connect_phase: ConnectPhase,
    discovery_phase: DiscoveryPhase,
}

impl ConnectionSession {
    fn new(device: DeviceId, name: String, epoch: u64) -> Self {
        Self {
            device,
            name,
            epoch,
            handle: None,
            characteristic: None,
            state: ConnectionState::Connecting,
            mtu_negotiated: false,
            connect_phase: ConnectPhase::ClearingCache { retried: false },
            discovery_phase: DiscoveryPhase::Settling,
        }
    }

    fn owns(&self, handle: GattHandle) -> bool {
        self.handle == Some(handle)
    }
}

/// 等待退避结束的自动重连
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingReconnect {
    device: DeviceId,
    name: String,
    epoch: u64,
}

/// 连接管理器输入事件
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// 扫描命中或手动指定设备
    Connect { device: DeviceId, name: String },
    /// `refresh_cache` 的同步结果
    CacheRefreshed(Result<(), AdapterError>),
    /// `connect` 的同步结果
    ConnectIssued(Result<GattHandle, AdapterError>),
    Link {
        handle: GattHandle,
        status: GattStatus,
        state: LinkState,
    },
    MtuRequested(Result<(), AdapterError>),
    MtuChanged {
        handle: GattHandle,
        mtu: u16,
        status: GattStatus,
    },
    DiscoveryRequested(Result<(), AdapterError>),
    ServicesDiscovered {
        handle: GattHandle,
        status: GattStatus,
        services: Vec<ServiceInfo>,
    },
    WriteIssued(Result<(), AdapterError>),
    Written {
        handle: GattHandle,
        uuid: Uuid,
        status: GattStatus,
    },
    Timer(Timer),
    /// 显式断开
    Teardown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionManager {
    session: Option<ConnectionSession>,
    pending_reconnect: Option<PendingReconnect>,
    next_epoch: u64,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Option<&ConnectionSession> {
        self.session.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.session
            .as_ref()
            .map_or(ConnectionState::Idle, |s| s.state)
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready() && self.characteristic().is_some()
    }

    pub fn characteristic(&self) -> Option<&ResolvedCharacteristic> {
        self.session.as_ref().and_then(|s| s.characteristic.as_ref())
    }

    pub fn handle(&self) -> Option<GattHandle> {
        self.session.as_ref().and_then(|s| s.handle)
    }

    pub fn reconnect_pending(&self) -> bool {
        self.pending_reconnect.is_some()
    }

    /// 该纪元的 Settle 定时器是否仍有效
    pub fn awaits_settle(&self, epoch: u64) -> bool {
        self.session.as_ref().is_some_and(|s| {
            s.epoch == epoch
                && s.state == ConnectionState::Connected(Readiness::ServicesPending)
                && s.discovery_phase == DiscoveryPhase::Settling
        })
    }

    /// 单步状态转换
    pub fn step(mut self, event: ConnectionEvent, config: &ConnectionConfig) -> (Self, Vec<Effect>) {
        let effects = match event {
            ConnectionEvent::Connect { device, name } => self.on_connect(device, name),
            ConnectionEvent::CacheRefreshed(result) => self.on_cache_refreshed(result, config),
            ConnectionEvent::ConnectIssued(result) => self.on_connect_issued(result),
            ConnectionEvent::Link {
                handle,
                status,
                state,
            } => self.on_link(handle, status, state, config),
            ConnectionEvent::MtuRequested(result) => self.on_mtu_requested(result),
            ConnectionEvent::MtuChanged {
                handle,
                mtu,
                status,
            } => self.on_mtu_changed(handle, mtu, status),
            ConnectionEvent::DiscoveryRequested(result) => self.on_discovery_requested(result),
            ConnectionEvent::ServicesDiscovered {
                handle,
                status,
                services,
            } => self.on_services_discovered(handle, status, &services, config),
            ConnectionEvent::WriteIssued(result) => self.on_write_issued(result),
            ConnectionEvent::Written {
                handle,
                uuid,
                status,
            } => self.on_written(handle, uuid, status),
            ConnectionEvent::Timer(timer) => self.on_timer(timer, config),
            ConnectionEvent::Teardown => self.teardown(),
        };
        (self, effects)
    }

    /// 写入路径：调用方需先确认 [`Self::is_ready`]
    pub fn write(&self, command: &Command) -> Vec<Effect> {
        let Some(session) = &self.session else {
            return vec![Effect::status("Not connected to device")];
        };
        let (Some(handle), Some(characteristic)) = (session.handle, &session.characteristic)
        else {
            error!("No characteristic available for writing");
            return vec![Effect::status("Not connected to device")];
        };

        match gatt::prepare_write(characteristic, command) {
            Some(request) => {
                debug!(
                    "Writing command: '{}' to characteristic {} ({:?})",
                    command.text(),
                    characteristic.uuid,
                    request.kind
                );
                vec![Effect::Write {
                    handle,
                    characteristic: characteristic.clone(),
                    request,
                }]
            }
            None => {
                error!("Characteristic doesn't support writing");
                vec![Effect::status(
                    Fault::WriteRejected("Characteristic not writable".into()).to_string(),
                )]
            }
        }
    }

    fn allocate_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    fn on_connect(&mut self, device: DeviceId, name: String) -> Vec<Effect> {
        if self.state().is_busy() {
            warn!(
                "Ignoring connect to {}: connection already {}",
                device,
                self.state()
            );
            return vec![Effect::status("Already scanning or connecting...")];
        }

        let mut effects = Vec::new();
        if self.pending_reconnect.take().is_some() {
            effects.push(Effect::CancelTimer(TimerKind::Reconnect));
        }

        let epoch = self.allocate_epoch();
        info!("Attempting connection to: {} ({})", name, device);
        effects.push(Effect::status(format!("Connecting to {name}...")));
        effects.push(Effect::RefreshCache(device.clone()));
        self.session = Some(ConnectionSession::new(device, name, epoch));
        effects
    }

    fn on_cache_refreshed(
        &mut self,
        result: Result<(), AdapterError>,
        config: &ConnectionConfig,
    ) -> Vec<Effect> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        let ConnectPhase::ClearingCache { retried } = session.connect_phase else {
            return Vec::new();
        };

        match result {
            Ok(()) => debug!("GATT cache cleared"),
            Err(e) if !retried => {
                warn!("Failed to clear GATT cache ({}), disconnecting and retrying", e);
                session.connect_phase = ConnectPhase::ClearingCache { retried: true };
                return vec![
                    Effect::DisconnectDevice(session.device.clone()),
                    Effect::RefreshCache(session.device.clone()),
                ];
            }
            Err(e) => warn!("Failed to clear GATT cache again ({}), connecting anyway", e),
        }

        session.connect_phase = ConnectPhase::Delaying;
        vec![Effect::ArmTimer(
            Timer::new(TimerKind::ConnectDelay, session.epoch),
            config.connect_delay,
        )]
    }

    fn on_connect_issued(&mut self, result: Result<GattHandle, AdapterError>) -> Vec<Effect> {
        let pending = self.session.as_ref().is_some_and(|s| {
            s.state == ConnectionState::Connecting
                && s.connect_phase == ConnectPhase::Requested
                && s.handle.is_none()
        });

        match result {
            Ok(handle) if pending => {
                debug!("GATT connection requested, handle {}", handle.raw());
                if let Some(session) = self.session.as_mut() {
                    session.handle = Some(handle);
                }
                Vec::new()
            }
            Ok(handle) => {
                // 会话在请求期间已被拆除
                debug!("Closing orphaned GATT handle {}", handle.raw());
                vec![Effect::Close(handle)]
            }
            Err(e) if pending => {
                error!("Failed to create GATT connection: {}", e);
                self.session = None;
                vec![Effect::status("Connection failed")]
            }
            Err(_) => Vec::new(),
        }
    }

    fn on_link(
        &mut self,
        handle: GattHandle,
        status: GattStatus,
        state: LinkState,
        config: &ConnectionConfig,
    ) -> Vec<Effect> {
        let Some(session) = self.session.as_mut().filter(|s| s.owns(handle)) else {
            debug!(
                "Ignoring link event for stale handle {} ({:?})",
                handle.raw(),
                state
            );
            return Vec::new();
        };

        match state {
            LinkState::Connected => {
                if session.state != ConnectionState::Connecting {
                    return Vec::new();
                }
                info!("Connected to GATT server (status: {})", status);
                session.state = ConnectionState::Connected(Readiness::ServicesPending);
                session.discovery_phase = DiscoveryPhase::Settling;
                vec![
                    Effect::status("Connected, discovering services..."),
                    Effect::ArmTimer(
                        Timer::new(TimerKind::Settle, session.epoch),
                        config.settle_delay,
                    ),
                ]
            }
            LinkState::Connecting => {
                debug!("Connecting to GATT server...");
                vec![Effect::status("Connecting...")]
            }
            LinkState::Disconnecting => {
                debug!("Disconnecting from GATT server...");
                session.state = ConnectionState::Disconnecting;
                vec![Effect::status("Disconnecting...")]
            }
            LinkState::Disconnected => self.on_link_down(handle, status, config),
        }
    }

    fn on_link_down(
        &mut self,
        handle: GattHandle,
        status: GattStatus,
        config: &ConnectionConfig,
    ) -> Vec<Effect> {
        warn!("Disconnected from GATT server (status: {})", status);

        // 句柄和特征先于任何重连调度被释放
        let Some(session) = self.session.take() else {
            return Vec::new();
        };
        let mut effects = vec![
            Effect::CancelTimer(TimerKind::ConnectDelay),
            Effect::CancelTimer(TimerKind::Settle),
            Effect::Close(handle),
            Effect::status(Fault::LinkError(status).to_string()),
        ];

        if status.is_retryable() {
            let epoch = self.allocate_epoch();
            info!(
                "Scheduling reconnect to {} in {:?}",
                session.device, config.reconnect_backoff
            );
            self.pending_reconnect = Some(PendingReconnect {
                device: session.device,
                name: session.name,
                epoch,
            });
            effects.push(Effect::ArmTimer(
                Timer::new(TimerKind::Reconnect, epoch),
                config.reconnect_backoff,
            ));
        }
        effects
    }

    fn on_timer(&mut self, timer: Timer, config: &ConnectionConfig) -> Vec<Effect> {
        if timer.kind == TimerKind::Reconnect {
            return match self.pending_reconnect.take() {
                Some(pending) if pending.epoch == timer.epoch && self.session.is_none() => {
                    info!("Auto-retry connection to {}", pending.device);
                    self.on_connect(pending.device, pending.name)
                }
                other => {
                    self.pending_reconnect = other;
                    debug!("Ignoring stale reconnect timer (epoch {})", timer.epoch);
                    Vec::new()
                }
            };
        }

        let Some(session) = self.session.as_mut().filter(|s| s.epoch == timer.epoch) else {
            debug!("Ignoring stale {:?} timer (epoch {})", timer.kind, timer.epoch);
            return Vec::new();
        };

        match timer.kind {
            TimerKind::ConnectDelay
                if session.state == ConnectionState::Connecting
                    && session.connect_phase == ConnectPhase::Delaying =>
            {
                session.connect_phase = ConnectPhase::Requested;
                vec![Effect::Connect(session.device.clone())]
            }
            TimerKind::Settle
                if session.state == ConnectionState::Connected(Readiness::ServicesPending)
                    && session.discovery_phase == DiscoveryPhase::Settling =>
            {
                let Some(handle) = session.handle else {
                    return Vec::new();
                };
                session.discovery_phase = DiscoveryPhase::MtuRequested;
                debug!("Requesting MTU {}", config.requested_mtu);
                vec![Effect::RequestMtu(handle, config.requested_mtu)]
            }
            _ => {
                debug!("Ignoring {:?} timer in state {}", timer.kind, session.state);
                Vec::new()
            }
        }
    }

    fn start_discovery(&mut self) -> Vec<Effect> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        let Some(handle) = session.handle else {
            return Vec::new();
        };
        session.discovery_phase = DiscoveryPhase::Discovering;
        debug!("Starting service discovery...");
        vec![Effect::DiscoverServices(handle)]
    }

    fn awaiting_mtu(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.discovery_phase == DiscoveryPhase::MtuRequested)
    }

    fn on_mtu_requested(&mut self, result: Result<(), AdapterError>) -> Vec<Effect> {
        match result {
            Ok(()) => Vec::new(),
            Err(e) if self.awaiting_mtu() => {
                warn!("MTU request rejected ({}), discovering services anyway", e);
                self.start_discovery()
            }
            Err(_) => Vec::new(),
        }
    }

    fn on_mtu_changed(&mut self, handle: GattHandle, mtu: u16, status: GattStatus) -> Vec<Effect> {
        let owned = self.session.as_ref().is_some_and(|s| s.owns(handle));
        if !owned || !self.awaiting_mtu() {
            return Vec::new();
        }

        debug!("MTU changed to {}, status: {}", mtu, status);
        if status.is_success()
            && let Some(session) = self.session.as_mut()
        {
            session.mtu_negotiated = true;
        }
        self.start_discovery()
    }

    fn on_discovery_requested(&mut self, result: Result<(), AdapterError>) -> Vec<Effect> {
        match result {
            Ok(()) => Vec::new(),
            Err(e) => {
                error!("Failed to start service discovery: {}", e);
                if let Some(session) = self.session.as_mut() {
                    session.discovery_phase = DiscoveryPhase::Unresolved;
                }
                vec![Effect::status("Failed to start service discovery")]
            }
        }
    }

    fn on_services_discovered(
        &mut self,
        handle: GattHandle,
        status: GattStatus,
        services: &[ServiceInfo],
        config: &ConnectionConfig,
    ) -> Vec<Effect> {
        let Some(session) = self.session.as_mut().filter(|s| {
            s.owns(handle) && s.discovery_phase == DiscoveryPhase::Discovering
        }) else {
            return Vec::new();
        };

        if !status.is_success() {
            error!("Service discovery failed with status: {}", status);
            session.discovery_phase = DiscoveryPhase::Unresolved;
            return vec![Effect::status(format!("Service discovery failed: {status}"))];
        }

        debug!("Services discovered successfully");
        match gatt::resolve_target(services, &config.identity) {
            Ok(characteristic) => {
                info!("Target characteristic found: {}", characteristic.uuid);
                session.characteristic = Some(characteristic);
                session.state = ConnectionState::Connected(Readiness::Ready);
                vec![Effect::status("Ready to send commands!")]
            }
            Err(failure) => {
                error!("{}", failure);
                session.discovery_phase = DiscoveryPhase::Unresolved;
                vec![Effect::status(Fault::from(failure).to_string())]
            }
        }
    }

    fn on_write_issued(&mut self, result: Result<(), AdapterError>) -> Vec<Effect> {
        match result {
            Ok(()) => {
                debug!("Write request queued successfully");
                vec![Effect::status("Sending command...")]
            }
            Err(e) => {
                error!("Failed to queue write request: {}", e);
                vec![Effect::status("Failed to send command")]
            }
        }
    }

    fn on_written(&mut self, handle: GattHandle, uuid: Uuid, status: GattStatus) -> Vec<Effect> {
        if !self.session.as_ref().is_some_and(|s| s.owns(handle)) {
            return Vec::new();
        }
        if status.is_success() {
            info!("Command sent successfully to {}", uuid);
            vec![Effect::status("Command sent successfully!")]
        } else {
            error!("Failed to send command to {}, status: {}", uuid, status);
            vec![Effect::status(format!(
                "Failed to send command (status: {status})"
            ))]
        }
    }

    fn teardown(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.pending_reconnect.take().is_some() {
            effects.push(Effect::CancelTimer(TimerKind::Reconnect));
        }

        let Some(session) = self.session.take() else {
            return effects;
        };
        debug!("Cleaning up GATT connection to {}", session.device);
        effects.push(Effect::CancelTimer(TimerKind::ConnectDelay));
        effects.push(Effect::CancelTimer(TimerKind::Settle));
        if let Some(handle) = session.handle {
            // 只有认为链路已建立时才发出断开
            if matches!(session.state, ConnectionState::Connected(_)) {
                effects.push(Effect::Disconnect(handle));
            }
            effects.push(Effect::Close(handle));
        }
        effects.push(Effect::status("Disconnected"));
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{CHARACTERISTIC_UUID, CharacteristicInfo, SERVICE_UUID};
    use btleplug::api::CharPropFlags;

    const H: GattHandle = GattHandle::new(7);

    fn device() -> DeviceId {
        DeviceId::new("24:0A:C4:00:00:01")
    }

    fn services(properties: CharPropFlags) -> Vec<ServiceInfo> {
        vec![ServiceInfo {
            uuid: SERVICE_UUID,
            characteristics: vec![CharacteristicInfo {
                uuid: CHARACTERISTIC_UUID,
                properties,
            }],
        }]
    }

    fn run(
        manager: ConnectionManager,
        events: impl IntoIterator<Item = ConnectionEvent>,
    ) -> (ConnectionManager, Vec<Effect>) {
        let config = ConnectionConfig::default();
        events
            .into_iter()
            .fold((manager, Vec::new()), |(m, mut all), event| {
                let (m, effects) = m.step(event, &config);
                all.extend(effects);
                (m, all)
            })
    }

    fn link(status: i32, state: LinkState) -> ConnectionEvent {
        ConnectionEvent::Link {
            handle: H,
            status: GattStatus(status),
            state,
        }
    }

    fn timer(kind: TimerKind, epoch: u64) -> ConnectionEvent {
        ConnectionEvent::Timer(Timer::new(kind, epoch))
    }

    /// 从 Idle 走到 Connected(ServicesPending)
    fn connected() -> ConnectionManager {
        let (m, _) = run(
            ConnectionManager::new(),
            [
                ConnectionEvent::Connect {
                    device: device(),
                    name: "ESP32-Motor-7".into(),
                },
                ConnectionEvent::CacheRefreshed(Ok(())),
                timer(TimerKind::ConnectDelay, 1),
                ConnectionEvent::ConnectIssued(Ok(H)),
                link(0, LinkState::Connected),
            ],
        );
        assert_eq!(m.state(), ConnectionState::Connected(Readiness::ServicesPending));
        m
    }

    fn ready(properties: CharPropFlags) -> ConnectionManager {
        let (m, _) = run(
            connected(),
            [
                timer(TimerKind::Settle, 1),
                ConnectionEvent::MtuChanged {
                    handle: H,
                    mtu: 512,
                    status: GattStatus::SUCCESS,
                },
                ConnectionEvent::ServicesDiscovered {
                    handle: H,
                    status: GattStatus::SUCCESS,
                    services: services(properties),
                },
            ],
        );
        assert!(m.is_ready());
        m
    }

    #[test]
    fn test_connect_clears_cache_then_delays() {
        let config = ConnectionConfig::default();
        let (m, effects) = ConnectionManager::new().step(
            ConnectionEvent::Connect {
                device: device(),
                name: "ESP32-Motor-7".into(),
            },
            &config,
        );
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(
            effects,
            vec![
                Effect::status("Connecting to ESP32-Motor-7..."),
                Effect::RefreshCache(device()),
            ]
        );

        let (m, effects) = m.step(ConnectionEvent::CacheRefreshed(Ok(())), &config);
        assert_eq!(
            effects,
            vec![Effect::ArmTimer(
                Timer::new(TimerKind::ConnectDelay, 1),
                Duration::from_millis(500)
            )]
        );

        let (_, effects) = m.step(timer(TimerKind::ConnectDelay, 1), &config);
        assert_eq!(effects, vec![Effect::Connect(device())]);
    }

    #[test]
    fn test_cache_refresh_failure_falls_back_once() {
        let (m, effects) = run(
            ConnectionManager::new(),
            [
                ConnectionEvent::Connect {
                    device: device(),
                    name: "x".into(),
                },
                ConnectionEvent::CacheRefreshed(Err(AdapterError::Unsupported)),
            ],
        );
        assert!(effects.ends_with(&[
            Effect::DisconnectDevice(device()),
            Effect::RefreshCache(device()),
        ]));

        // 第二次失败不再回退，直接进入连接延迟
        let (m, effects) = run(m, [ConnectionEvent::CacheRefreshed(Err(AdapterError::Unsupported))]);
        assert!(matches!(
            effects.as_slice(),
            [Effect::ArmTimer(Timer { kind: TimerKind::ConnectDelay, .. }, _)]
        ));
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_no_second_connect_while_busy() {
        let connect = ConnectionEvent::Connect {
            device: DeviceId::new("AA:BB:CC:DD:EE:FF"),
            name: "other".into(),
        };

        for m in [connected(), ready(CharPropFlags::WRITE)] {
            let before = m.clone();
            let (after, effects) = run(m, [connect.clone()]);
            assert_eq!(effects, vec![Effect::status("Already scanning or connecting...")]);
            assert_eq!(after, before);
            assert!(!effects.iter().any(|e| matches!(e, Effect::Connect(_))));
        }
    }

    #[test]
    fn test_mtu_failure_still_discovers() {
        let (m, effects) = run(
            connected(),
            [
                timer(TimerKind::Settle, 1),
                ConnectionEvent::MtuChanged {
                    handle: H,
                    mtu: 23,
                    status: GattStatus::FAILURE,
                },
            ],
        );
        assert_eq!(
            effects,
            vec![Effect::RequestMtu(H, 512), Effect::DiscoverServices(H)]
        );
        assert!(!m.session().unwrap().mtu_negotiated);

        let (m, effects) = run(
            m,
            [ConnectionEvent::ServicesDiscovered {
                handle: H,
                status: GattStatus::SUCCESS,
                services: services(CharPropFlags::WRITE),
            }],
        );
        assert_eq!(effects, vec![Effect::status("Ready to send commands!")]);
        assert_eq!(m.state(), ConnectionState::Connected(Readiness::Ready));
    }

    #[test]
    fn test_rejected_mtu_request_still_discovers() {
        let (_, effects) = run(
            connected(),
            [
                timer(TimerKind::Settle, 1),
                ConnectionEvent::MtuRequested(Err(AdapterError::Unsupported)),
            ],
        );
        assert_eq!(effects.last(), Some(&Effect::DiscoverServices(H)));
    }

    #[test]
    fn test_resolution_failure_keeps_connection() {
        let (m, effects) = run(
            connected(),
            [
                timer(TimerKind::Settle, 1),
                ConnectionEvent::MtuChanged {
                    handle: H,
                    mtu: 512,
                    status: GattStatus::SUCCESS,
                },
                ConnectionEvent::ServicesDiscovered {
                    handle: H,
                    status: GattStatus::SUCCESS,
                    services: Vec::new(),
                },
            ],
        );
        assert_eq!(effects.last(), Some(&Effect::status("Service not found")));
        assert_eq!(m.state(), ConnectionState::Connected(Readiness::ServicesPending));
        assert!(m.handle().is_some());
        assert!(!m.is_ready());
    }

    #[test]
    fn test_link_down_retry_table() {
        for (status, retry) in [(133, true), (8, true), (0, false), (19, false), (22, false)] {
            let (m, effects) = run(ready(CharPropFlags::WRITE), [link(status, LinkState::Disconnected)]);

            assert_eq!(m.state(), ConnectionState::Idle, "status {status}");
            assert!(m.handle().is_none());
            assert!(m.characteristic().is_none());

            let close = effects.iter().position(|e| *e == Effect::Close(H));
            let arm = effects.iter().position(|e| {
                matches!(e, Effect::ArmTimer(Timer { kind: TimerKind::Reconnect, .. }, _))
            });
            assert!(close.is_some());
            assert_eq!(arm.is_some(), retry, "status {status}");
            if let (Some(close), Some(arm)) = (close, arm) {
                assert!(close < arm);
            }
        }
    }

    #[test]
    fn test_reconnect_after_backoff_targets_same_device() {
        let (m, effects) = run(connected(), [link(133, LinkState::Disconnected)]);
        assert!(effects.contains(&Effect::status(
            "Connection error 133 - Try restarting Bluetooth"
        )));
        assert!(effects.contains(&Effect::ArmTimer(
            Timer::new(TimerKind::Reconnect, 2),
            Duration::from_millis(3000)
        )));

        let (m, effects) = run(m, [timer(TimerKind::Reconnect, 2)]);
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.session().unwrap().device, device());
        assert!(effects.contains(&Effect::RefreshCache(device())));
    }

    #[test]
    fn test_stale_timers_are_noops() {
        // 拆除后到达的重连定时器
        let (m, _) = run(
            connected(),
            [link(8, LinkState::Disconnected), ConnectionEvent::Teardown],
        );
        let (after, effects) = run(m.clone(), [timer(TimerKind::Reconnect, 2)]);
        assert!(effects.is_empty());
        assert_eq!(after, m);

        // 旧会话的稳定定时器
        let m = connected();
        let (after, effects) = run(m.clone(), [timer(TimerKind::Settle, 99)]);
        assert!(effects.is_empty());
        assert_eq!(after, m);

        // 旧句柄的链路事件
        let (after, effects) = run(
            m.clone(),
            [ConnectionEvent::Link {
                handle: GattHandle::new(1),
                status: GattStatus(133),
                state: LinkState::Disconnected,
            }],
        );
        assert!(effects.is_empty());
        assert_eq!(after, m);
    }

    #[test]
    fn test_write_without_response() {
        let m = ready(CharPropFlags::WRITE_WITHOUT_RESPONSE);
        let effects = m.write(&Command::vibrate());
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            Effect::Write { handle, request, .. } => {
                assert_eq!(*handle, H);
                assert_eq!(request.kind, gatt::WriteKind::WithoutResponse);
                assert_eq!(request.payload, b"vibrate");
            }
            other => panic!("unexpected effect {other:?}"),
        }
    }

    #[test]
    fn test_write_not_writable() {
        let m = ready(CharPropFlags::READ);
        assert_eq!(
            m.write(&Command::vibrate()),
            vec![Effect::status("Characteristic not writable")]
        );
    }

    #[test]
    fn test_teardown_only_disconnects_live_link() {
        let (m, effects) = run(ready(CharPropFlags::WRITE), [ConnectionEvent::Teardown]);
        assert!(effects.contains(&Effect::Disconnect(H)));
        assert!(effects.contains(&Effect::Close(H)));
        assert_eq!(m.state(), ConnectionState::Idle);

        // 链路尚未建立
        let (_, effects) = run(
            ConnectionManager::new(),
            [
                ConnectionEvent::Connect {
                    device: device(),
                    name: "x".into(),
                },
                ConnectionEvent::CacheRefreshed(Ok(())),
                timer(TimerKind::ConnectDelay, 1),
                ConnectionEvent::ConnectIssued(Ok(H)),
                ConnectionEvent::Teardown,
            ],
        );
        assert!(!effects.contains(&Effect::Disconnect(H)));
        assert!(effects.contains(&Effect::Close(H)));
    }
}
