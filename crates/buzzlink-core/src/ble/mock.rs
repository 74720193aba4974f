//! 记录型适配器
//!
//! 记录每一次调用，按配置返回同步结果；可选地模拟一个外设，
//! 自动回报连接、MTU、服务发现和写入完成事件。
//! 所有状态都在 `Arc` 里，测试保留一个克隆即可在控制器运行时检查调用或注入事件。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use btleplug::api::CharPropFlags;
use uuid::Uuid;

use crate::ble::adapter::{AdapterEventSender, BleAdapter};
use crate::ble::{
    AdapterError, AdapterEvent, CHARACTERISTIC_UUID, CharacteristicInfo, DeviceId, GattHandle,
    GattStatus, LinkState, ResolvedCharacteristic, SERVICE_UUID, ScanFailure, ServiceInfo,
    WriteRequest,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    StartScan,
    StopScan,
    RefreshCache(DeviceId),
    DisconnectDevice(DeviceId),
    Connect(DeviceId),
    RequestMtu(GattHandle, u16),
    DiscoverServices(GattHandle),
    Write {
        handle: GattHandle,
        characteristic: Uuid,
        request: WriteRequest,
    },
    Disconnect(GattHandle),
    Close(GattHandle),
}

/// 模拟外设的行为
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedPeripheral {
    pub services: Vec<ServiceInfo>,
    pub mtu_status: GattStatus,
    pub write_status: GattStatus,
}

impl SimulatedPeripheral {
    /// 暴露目标服务和特征的外设
    pub fn motor(properties: CharPropFlags) -> Self {
        Self {
            services: vec![ServiceInfo {
                uuid: SERVICE_UUID,
                characteristics: vec![CharacteristicInfo {
                    uuid: CHARACTERISTIC_UUID,
                    properties,
                }],
            }],
            mtu_status: GattStatus::SUCCESS,
            write_status: GattStatus::SUCCESS,
        }
    }
}

#[derive(Debug)]
struct Behaviour {
    scan_result: Result<(), ScanFailure>,
    cache_refresh: Result<(), AdapterError>,
    connect_error: Option<AdapterError>,
    peripheral: Option<SimulatedPeripheral>,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            scan_result: Ok(()),
            cache_refresh: Ok(()),
            connect_error: None,
            peripheral: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordingAdapter {
    events: AdapterEventSender,
    calls: Arc<Mutex<Vec<AdapterCall>>>,
    behaviour: Arc<Mutex<Behaviour>>,
    next_handle: Arc<AtomicU64>,
}

impl RecordingAdapter {
    pub fn new(events: AdapterEventSender) -> Self {
        Self {
            events,
            calls: Arc::new(Mutex::new(Vec::new())),
            behaviour: Arc::new(Mutex::new(Behaviour::default())),
            next_handle: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_peripheral(self, peripheral: SimulatedPeripheral) -> Self {
        self.set_peripheral(Some(peripheral));
        self
    }

    pub fn set_peripheral(&self, peripheral: Option<SimulatedPeripheral>) {
        self.configure(|b| b.peripheral = peripheral);
    }

    pub fn set_scan_result(&self, result: Result<(), ScanFailure>) {
        self.configure(|b| b.scan_result = result);
    }

    pub fn set_cache_refresh(&self, result: Result<(), AdapterError>) {
        self.configure(|b| b.cache_refresh = result);
    }

    pub fn set_connect_error(&self, error: Option<AdapterError>) {
        self.configure(|b| b.connect_error = error);
    }

    /// 注入一个适配器事件（例如扫描结果或断开）
    pub fn emit(&self, event: AdapterEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Controller gone, dropping injected event");
        }
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    pub fn count(&self, predicate: impl Fn(&AdapterCall) -> bool) -> usize {
        self.calls().iter().filter(|c| predicate(c)).count()
    }

    fn configure(&self, f: impl FnOnce(&mut Behaviour)) {
        if let Ok(mut behaviour) = self.behaviour.lock() {
            f(&mut behaviour);
        }
    }

    fn peripheral(&self) -> Option<SimulatedPeripheral> {
        self.behaviour.lock().ok().and_then(|b| b.peripheral.clone())
    }

    fn record(&self, call: AdapterCall) {
        log::trace!("adapter call: {:?}", call);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl BleAdapter for RecordingAdapter {
    fn start_scan(&mut self) -> Result<(), ScanFailure> {
        self.record(AdapterCall::StartScan);
        self.behaviour
            .lock()
            .map(|b| b.scan_result.clone())
            .unwrap_or(Err(ScanFailure::InternalError))
    }

    fn stop_scan(&mut self) {
        self.record(AdapterCall::StopScan);
    }

    fn refresh_cache(&mut self, device: &DeviceId) -> Result<(), AdapterError> {
        self.record(AdapterCall::RefreshCache(device.clone()));
        self.behaviour
            .lock()
            .map(|b| b.cache_refresh.clone())
            .unwrap_or(Err(AdapterError::Unsupported))
    }

    fn disconnect_device(&mut self, device: &DeviceId) {
        self.record(AdapterCall::DisconnectDevice(device.clone()));
    }

    fn connect(&mut self, device: &DeviceId) -> Result<GattHandle, AdapterError> {
        self.record(AdapterCall::Connect(device.clone()));
        if let Some(error) = self.behaviour.lock().ok().and_then(|b| b.connect_error.clone()) {
            return Err(error);
        }

        let handle = GattHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        if self.peripheral().is_some() {
            self.emit(AdapterEvent::LinkStateChanged {
                handle,
                status: GattStatus::SUCCESS,
                state: LinkState::Connected,
            });
        }
        Ok(handle)
    }

    fn request_mtu(&mut self, handle: GattHandle, mtu: u16) -> Result<(), AdapterError> {
        self.record(AdapterCall::RequestMtu(handle, mtu));
        if let Some(peripheral) = self.peripheral() {
            let granted = if peripheral.mtu_status.is_success() { mtu } else { 23 };
            self.emit(AdapterEvent::MtuChanged {
                handle,
                mtu: granted,
                status: peripheral.mtu_status,
            });
        }
        Ok(())
    }

    fn discover_services(&mut self, handle: GattHandle) -> Result<(), AdapterError> {
        self.record(AdapterCall::DiscoverServices(handle));
        if let Some(peripheral) = self.peripheral() {
            self.emit(AdapterEvent::ServicesDiscovered {
                handle,
                status: GattStatus::SUCCESS,
                services: peripheral.services,
            });
        }
        Ok(())
    }

    fn write(
        &mut self,
        handle: GattHandle,
        characteristic: &ResolvedCharacteristic,
        request: &WriteRequest,
    ) -> Result<(), AdapterError> {
        self.record(AdapterCall::Write {
            handle,
            characteristic: characteristic.uuid,
            request: request.clone(),
        });
        if let Some(peripheral) = self.peripheral() {
            self.emit(AdapterEvent::CharacteristicWritten {
                handle,
                uuid: characteristic.uuid,
                status: peripheral.write_status,
            });
        }
        Ok(())
    }

    fn disconnect(&mut self, handle: GattHandle) {
        self.record(AdapterCall::Disconnect(handle));
    }

    fn close(&mut self, handle: GattHandle) {
        self.record(AdapterCall::Close(handle));
    }
}
