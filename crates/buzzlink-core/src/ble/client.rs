//! BLE Client - 基于 btleplug 的中心角色适配器
//!
//! 流程:
//! 1. 监听第一个适配器的中心事件流，扫描期间把发现的外设转成 [`DeviceDescriptor`]
//! 2. 连接、服务发现和写入都在派生任务中完成，结果以 [`AdapterEvent`] 回报
//! 3. 外设断开事件按连接句柄转发
//!
//! btleplug 不提供 MTU 协商和 GATT 缓存刷新：MTU 请求立即回报失败，
//! `refresh_cache` 返回 [`AdapterError::Unsupported`]。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time;

use crate::ble::adapter::{AdapterEventSender, BleAdapter};
use crate::ble::{
    AdapterError, AdapterEvent, CharacteristicInfo, DeviceDescriptor, DeviceId, GattHandle,
    GattStatus, LinkState, ResolvedCharacteristic, ScanFailure, ServiceInfo, WriteRequest,
};

/// 单次连接请求的超时
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// 未协商时的默认 ATT MTU
const DEFAULT_MTU: u16 = 23;

/// 连接失败原因映射为链路层状态码
pub fn connect_failure_status(err: &btleplug::Error) -> GattStatus {
    match err {
        btleplug::Error::TimedOut(_) => GattStatus::CONNECTION_TIMEOUT,
        _ => GattStatus::GATT_ERROR,
    }
}

/// 扫描期间见过的设备，每次开始扫描时清空
struct KnownDevices<P>(Mutex<HashMap<DeviceId, P>>);

impl<P: Clone> KnownDevices<P> {
    fn new() -> Self {
        Self(Mutex::new(HashMap::new()))
    }

    fn remember(&self, device: DeviceId, id: P) {
        if let Ok(mut known) = self.0.lock() {
            known.insert(device, id);
        }
    }

    fn lookup(&self, device: &DeviceId) -> Option<P> {
        self.0.lock().ok().and_then(|k| k.get(device).cloned())
    }

    fn forget_all(&self) {
        if let Ok(mut known) = self.0.lock() {
            known.clear();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().map_or(0, |k| k.len())
    }
}

struct Link {
    device: DeviceId,
    peripheral: Arc<OnceCell<Peripheral>>,
    task: Option<JoinHandle<()>>,
}

/// 扫描与连接任务共享的状态
#[derive(Clone)]
struct Shared {
    adapter: Adapter,
    events: AdapterEventSender,
    scanning: Arc<AtomicBool>,
    known: Arc<KnownDevices<PeripheralId>>,
    /// 已建立链路的外设到句柄的映射
    linked: Arc<Mutex<HashMap<PeripheralId, GattHandle>>>,
}

impl Shared {
    fn emit(&self, event: AdapterEvent) {
        if self.events.send(event).is_err() {
            debug!("Adapter event receiver dropped");
        }
    }

    async fn find_peripheral(&self, device: &DeviceId) -> Result<Peripheral, btleplug::Error> {
        if let Some(id) = self.known.lookup(device) {
            return self.adapter.peripheral(&id).await;
        }

        for peripheral in self.adapter.peripherals().await? {
            if let Some(props) = peripheral.properties().await?
                && props.address.to_string().eq_ignore_ascii_case(device.as_str())
            {
                return Ok(peripheral);
            }
        }
        Err(btleplug::Error::DeviceNotFound)
    }

    async fn describe(&self, id: &PeripheralId) -> Option<DeviceDescriptor> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        let props = peripheral.properties().await.ok()??;
        let device = DeviceDescriptor {
            id: DeviceId::new(props.address.to_string()),
            name: props.local_name,
            service_uuids: props.services.into_iter().collect(),
            rssi: props.rssi.unwrap_or(0),
        };
        self.known.remember(device.id.clone(), id.clone());
        Some(device)
    }

    /// 中心事件泵：扫描结果与意外断开
    async fn watch(self) {
        let mut events = match self.adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to subscribe to adapter events: {}", e);
                return;
            }
        };

        while let Some(event) = events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    if !self.scanning.load(Ordering::Relaxed) {
                        continue;
                    }
                    if let Some(device) = self.describe(&id).await {
                        self.emit(AdapterEvent::DeviceFound(device));
                    }
                }
                CentralEvent::DeviceDisconnected(id) => {
                    let handle = self.linked.lock().ok().and_then(|mut l| l.remove(&id));
                    if let Some(handle) = handle {
                        // BlueZ 不报告断开原因，意外断开按监督超时处理
                        warn!("Peripheral {:?} dropped the link", id);
                        self.emit(AdapterEvent::LinkStateChanged {
                            handle,
                            status: GattStatus::CONNECTION_TIMEOUT,
                            state: LinkState::Disconnected,
                        });
                    }
                }
                _ => {}
            }
        }
        debug!("Adapter event stream ended");
    }
}

pub struct BleClient {
    shared: Option<Shared>,
    links: HashMap<GattHandle, Link>,
    next_handle: u64,
    watcher: Option<JoinHandle<()>>,
}

impl BleClient {
    /// 打开第一个可用适配器；没有适配器时所有请求都返回 [`AdapterError::Unavailable`]
    pub async fn new(events: AdapterEventSender) -> Self {
        let adapter = match Self::first_adapter().await {
            Ok(adapter) => Some(adapter),
            Err(e) => {
                warn!("No usable Bluetooth adapter: {}", e);
                None
            }
        };

        let shared = adapter.map(|adapter| Shared {
            adapter,
            events,
            scanning: Arc::new(AtomicBool::new(false)),
            known: Arc::new(KnownDevices::new()),
            linked: Arc::new(Mutex::new(HashMap::new())),
        });
        let watcher = shared.clone().map(|s| tokio::spawn(s.watch()));

        Self {
            shared,
            links: HashMap::new(),
            next_handle: 1,
            watcher,
        }
    }

    async fn first_adapter() -> Result<Adapter, btleplug::Error> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        adapters.into_iter().next().ok_or(btleplug::Error::DeviceNotFound)
    }

    pub fn has_adapter(&self) -> bool {
        self.shared.is_some()
    }

    fn shared(&self) -> Result<&Shared, AdapterError> {
        self.shared.as_ref().ok_or(AdapterError::Unavailable)
    }

    fn link(&self, handle: GattHandle) -> Result<(Shared, Arc<OnceCell<Peripheral>>), AdapterError> {
        let shared = self.shared()?.clone();
        let link = self.links.get(&handle).ok_or(AdapterError::UnknownHandle)?;
        Ok((shared, link.peripheral.clone()))
    }
}

impl Drop for BleClient {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        for link in self.links.values_mut() {
            if let Some(task) = link.task.take() {
                task.abort();
            }
        }
    }
}

impl BleAdapter for BleClient {
    fn start_scan(&mut self) -> Result<(), ScanFailure> {
        let shared = self
            .shared
            .clone()
            .ok_or(ScanFailure::RegistrationFailed)?;
        if shared.scanning.swap(true, Ordering::SeqCst) {
            return Err(ScanFailure::AlreadyStarted);
        }
        shared.known.forget_all();

        tokio::spawn(async move {
            debug!("Starting unfiltered LE scan");
            if let Err(e) = shared.adapter.start_scan(ScanFilter::default()).await {
                error!("Failed to start scan: {}", e);
                shared.scanning.store(false, Ordering::SeqCst);
                shared.emit(AdapterEvent::ScanFailed(ScanFailure::InternalError));
            }
        });
        Ok(())
    }

    fn stop_scan(&mut self) {
        let Some(shared) = self.shared.clone() else {
            return;
        };
        if !shared.scanning.swap(false, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(async move {
            if let Err(e) = shared.adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
    }

    fn refresh_cache(&mut self, _device: &DeviceId) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported)
    }

    fn disconnect_device(&mut self, device: &DeviceId) {
        let Ok(shared) = self.shared().cloned() else {
            return;
        };
        let device = device.clone();
        tokio::spawn(async move {
            let Ok(peripheral) = shared.find_peripheral(&device).await else {
                return;
            };
            if peripheral.is_connected().await.unwrap_or(false) {
                debug!("Disconnecting {} before reconnecting", device);
                if let Err(e) = peripheral.disconnect().await {
                    warn!("Disconnect of {} failed: {}", device, e);
                }
            }
        });
    }

    fn connect(&mut self, device: &DeviceId) -> Result<GattHandle, AdapterError> {
        let shared = self.shared()?.clone();
        let handle = GattHandle::new(self.next_handle);
        self.next_handle += 1;

        let slot = Arc::new(OnceCell::new());
        let task_slot = slot.clone();
        let task_device = device.clone();
        let task = tokio::spawn(async move {
            let result = async {
                let peripheral = shared.find_peripheral(&task_device).await?;
                info!("Connecting to {}", task_device);
                match time::timeout(CONNECT_TIMEOUT, peripheral.connect()).await {
                    Ok(result) => result?,
                    Err(_) => return Err(btleplug::Error::TimedOut(CONNECT_TIMEOUT)),
                }
                Ok::<_, btleplug::Error>(peripheral)
            }
            .await;

            match result {
                Ok(peripheral) => {
                    if let Ok(mut linked) = shared.linked.lock() {
                        linked.insert(peripheral.id(), handle);
                    }
                    let _ = task_slot.set(peripheral);
                    shared.emit(AdapterEvent::LinkStateChanged {
                        handle,
                        status: GattStatus::SUCCESS,
                        state: LinkState::Connected,
                    });
                }
                Err(e) => {
                    let status = connect_failure_status(&e);
                    error!("Connection to {} failed: {} (status {})", task_device, e, status);
                    shared.emit(AdapterEvent::LinkStateChanged {
                        handle,
                        status,
                        state: LinkState::Disconnected,
                    });
                }
            }
        });

        self.links.insert(
            handle,
            Link {
                device: device.clone(),
                peripheral: slot,
                task: Some(task),
            },
        );
        Ok(handle)
    }

    fn request_mtu(&mut self, handle: GattHandle, mtu: u16) -> Result<(), AdapterError> {
        let (shared, _) = self.link(handle)?;
        debug!("MTU {} requested, not supported by btleplug", mtu);
        shared.emit(AdapterEvent::MtuChanged {
            handle,
            mtu: DEFAULT_MTU,
            status: GattStatus::FAILURE,
        });
        Ok(())
    }

    fn discover_services(&mut self, handle: GattHandle) -> Result<(), AdapterError> {
        let (shared, slot) = self.link(handle)?;
        tokio::spawn(async move {
            let Some(peripheral) = slot.get() else {
                shared.emit(AdapterEvent::ServicesDiscovered {
                    handle,
                    status: GattStatus::GATT_ERROR,
                    services: Vec::new(),
                });
                return;
            };

            let (status, services) = match peripheral.discover_services().await {
                Ok(()) => {
                    let services = peripheral
                        .services()
                        .into_iter()
                        .map(|s| ServiceInfo {
                            uuid: s.uuid,
                            characteristics: s
                                .characteristics
                                .into_iter()
                                .map(|c| CharacteristicInfo {
                                    uuid: c.uuid,
                                    properties: c.properties,
                                })
                                .collect(),
                        })
                        .collect();
                    (GattStatus::SUCCESS, services)
                }
                Err(e) => {
                    error!("Service discovery failed: {}", e);
                    (GattStatus::GATT_ERROR, Vec::new())
                }
            };
            shared.emit(AdapterEvent::ServicesDiscovered {
                handle,
                status,
                services,
            });
        });
        Ok(())
    }

    fn write(
        &mut self,
        handle: GattHandle,
        characteristic: &ResolvedCharacteristic,
        request: &WriteRequest,
    ) -> Result<(), AdapterError> {
        let (shared, slot) = self.link(handle)?;
        let peripheral = slot.get().cloned().ok_or(AdapterError::UnknownHandle)?;
        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid)
            .ok_or_else(|| AdapterError::Rejected("characteristic not cached".into()))?;

        let uuid = characteristic.uuid;
        let payload = request.payload.clone();
        let kind = request.kind;
        tokio::spawn(async move {
            debug!("Writing {} bytes to {} ({:?})", payload.len(), uuid, kind);
            let status = match peripheral.write(&target, &payload, kind.into()).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    error!("Write to {} failed: {}", uuid, e);
                    GattStatus::FAILURE
                }
            };
            shared.emit(AdapterEvent::CharacteristicWritten {
                handle,
                uuid,
                status,
            });
        });
        Ok(())
    }

    fn disconnect(&mut self, handle: GattHandle) {
        let Ok((_, slot)) = self.link(handle) else {
            return;
        };
        let Some(peripheral) = slot.get().cloned() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect failed: {}", e);
            }
        });
    }

    fn close(&mut self, handle: GattHandle) {
        let Some(mut link) = self.links.remove(&handle) else {
            return;
        };
        debug!("Closing handle {} for {}", handle.raw(), link.device);
        if let Some(task) = link.task.take()
            && !task.is_finished()
        {
            task.abort();
        }
        if let Some(shared) = &self.shared
            && let Ok(mut linked) = shared.linked.lock()
        {
            linked.retain(|_, h| *h != handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_failure_status() {
        assert_eq!(
            connect_failure_status(&btleplug::Error::TimedOut(CONNECT_TIMEOUT)),
            GattStatus::CONNECTION_TIMEOUT
        );
        assert_eq!(
            connect_failure_status(&btleplug::Error::DeviceNotFound),
            GattStatus::GATT_ERROR
        );
        assert_eq!(
            connect_failure_status(&btleplug::Error::NotConnected),
            GattStatus::GATT_ERROR
        );
    }

    #[test]
    fn test_known_devices_forget_all() {
        let known = KnownDevices::new();
        known.remember(DeviceId::new("24:0A:C4:00:00:01"), 1u8);
        known.remember(DeviceId::new("24:0A:C4:00:00:02"), 2u8);
        known.remember(DeviceId::new("24:0A:C4:00:00:01"), 3u8);
        assert_eq!(known.len(), 2);
        assert_eq!(known.lookup(&DeviceId::new("24:0A:C4:00:00:01")), Some(3));

        known.forget_all();
        assert_eq!(known.len(), 0);
        assert_eq!(known.lookup(&DeviceId::new("24:0A:C4:00:00:02")), None);
    }
}
