//! BLE Scanner - 发现 ESP32 振动外设
//!
//! # 设备识别
//!
//! 按以下优先级依次判断，先命中者生效：
//! 1. 广播名包含固件名 `ESP32-Motor`（忽略大小写）
//! 2. 广播名包含厂商前缀 `ESP`（忽略大小写，宽松匹配）
//! 3. 广播的服务 UUID 列表包含目标服务 UUID
//!
//! 名称匹配开销最小且最具体；不同固件版本的命名并不统一，
//! 因此服务 UUID 作为最终依据。
//!
//! 同一扫描周期内多个候选同时命中时，先发现者胜出。

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::ble::{DeviceDescriptor, ScanFailure, TargetIdentity};
use crate::effect::{Effect, Timer, TimerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    ExactName,
    LooseName,
    ServiceUuid,
    NoMatch,
}

impl MatchKind {
    pub fn is_match(self) -> bool {
        self != MatchKind::NoMatch
    }
}

/// 匹配谓词：确定且完备，每个设备恰好落入一种结果
pub fn match_device(device: &DeviceDescriptor, identity: &TargetIdentity) -> MatchKind {
    if let Some(name) = device.name.as_deref() {
        let name = name.to_lowercase();
        if name.contains(&identity.exact_name.to_lowercase()) {
            return MatchKind::ExactName;
        }
        if name.contains(&identity.loose_name.to_lowercase()) {
            return MatchKind::LooseName;
        }
    }
    if device.service_uuids.contains(&identity.service_uuid) {
        return MatchKind::ServiceUuid;
    }
    MatchKind::NoMatch
}

/// 当前扫描会话
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSession {
    pub epoch: u64,
    pub deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Already scanning")]
pub struct AlreadyScanning;

/// 扫描器状态：同一时刻最多一个活动扫描
#[derive(Debug, Default)]
pub struct Scanner {
    session: Option<ScanSession>,
    next_epoch: u64,
}

impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_scanning(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&ScanSession> {
        self.session.as_ref()
    }

    pub fn start(&mut self, timeout: Duration) -> Result<Vec<Effect>, AlreadyScanning> {
        if self.session.is_some() {
            return Err(AlreadyScanning);
        }

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        self.session = Some(ScanSession {
            epoch,
            deadline: Instant::now() + timeout,
        });
        info!("Starting BLE scan for {} seconds", timeout.as_secs());

        Ok(vec![
            Effect::status("Scanning for ESP32 device..."),
            Effect::StartScan,
            Effect::ArmTimer(Timer::new(TimerKind::ScanTimeout, epoch), timeout),
        ])
    }

    /// 停止当前扫描，没有活动扫描时不产生任何效果
    pub fn stop(&mut self) -> Vec<Effect> {
        match self.session.take() {
            Some(_) => {
                debug!("BLE scan stopped");
                vec![Effect::StopScan, Effect::CancelTimer(TimerKind::ScanTimeout)]
            }
            None => Vec::new(),
        }
    }

    /// 处理一次扫描结果
    ///
    /// 命中时立即停止扫描，返回匹配类型和停止扫描的效果；
    /// 扫描已结束后迟到的结果被忽略。
    pub fn on_device_found(
        &mut self,
        device: &DeviceDescriptor,
        identity: &TargetIdentity,
    ) -> Option<(MatchKind, Vec<Effect>)> {
        if self.session.is_none() {
            debug!("Ignoring late scan result from {}", device.id);
            return None;
        }

        debug!(
            "Found BLE device: name={:?}, addr={}, rssi={} dBm, services={:?}",
            device.name, device.id, device.rssi, device.service_uuids
        );

        let kind = match_device(device, identity);
        match kind {
            MatchKind::ExactName => info!("Matched by name: {}", device.display_name()),
            MatchKind::LooseName => info!("Potential ESP device: {}", device.display_name()),
            MatchKind::ServiceUuid => info!("Matched by service UUID: {}", device.id),
            MatchKind::NoMatch => return None,
        }

        Some((kind, self.stop()))
    }

    /// 扫描超时；`epoch` 不属于当前会话时为空操作
    pub fn on_timeout(&mut self, epoch: u64) -> Option<Vec<Effect>> {
        match &self.session {
            Some(session) if session.epoch == epoch => {
                warn!("Scan timeout - no target device found");
                Some(self.stop())
            }
            _ => {
                debug!("Ignoring stale scan timer (epoch {})", epoch);
                None
            }
        }
    }

    /// 扫描启动失败或运行中失败，都按超时同等处理，不自动重试
    pub fn on_failed(&mut self, failure: &ScanFailure) -> Vec<Effect> {
        log::error!("BLE scan failed: {}", failure);
        let mut effects = Vec::new();
        if self.session.take().is_some() {
            effects.push(Effect::CancelTimer(TimerKind::ScanTimeout));
        }
        effects.push(Effect::status(format!("Scan failed: {failure}")));
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{DeviceId, SERVICE_UUID};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn device(name: Option<&str>, uuids: &[Uuid]) -> DeviceDescriptor {
        DeviceDescriptor {
            id: DeviceId::new("24:0A:C4:00:00:01"),
            name: name.map(str::to_string),
            service_uuids: uuids.iter().copied().collect::<BTreeSet<_>>(),
            rssi: -60,
        }
    }

    #[test]
    fn test_match_priority_table() {
        let identity = TargetIdentity::default();
        let other = Uuid::from_u128(0x180d);

        let cases = [
            (Some("ESP32-Motor-7"), vec![], MatchKind::ExactName),
            (Some("esp32-motor"), vec![SERVICE_UUID], MatchKind::ExactName),
            (Some("ESP32-DevKit"), vec![SERVICE_UUID], MatchKind::LooseName),
            (Some("my-esp-thing"), vec![], MatchKind::LooseName),
            (Some("Unknown"), vec![SERVICE_UUID], MatchKind::ServiceUuid),
            (None, vec![other, SERVICE_UUID], MatchKind::ServiceUuid),
            (Some("Unknown"), vec![other], MatchKind::NoMatch),
            (None, vec![], MatchKind::NoMatch),
        ];

        for (name, uuids, expected) in cases {
            let d = device(name, &uuids);
            assert_eq!(match_device(&d, &identity), expected, "{name:?} {uuids:?}");
            // 确定性
            assert_eq!(match_device(&d, &identity), expected);
        }
    }

    #[test]
    fn test_start_rejects_overlap() {
        let mut scanner = Scanner::new();
        let effects = scanner.start(Duration::from_secs(15)).unwrap();
        assert!(effects.contains(&Effect::StartScan));
        assert!(matches!(
            effects.last(),
            Some(Effect::ArmTimer(Timer { kind: TimerKind::ScanTimeout, epoch: 1 }, _))
        ));

        assert_eq!(scanner.start(Duration::from_secs(15)), Err(AlreadyScanning));
        assert!(scanner.is_scanning());
    }

    #[test]
    fn test_first_match_stops_scan() {
        let identity = TargetIdentity::default();
        let mut scanner = Scanner::new();
        scanner.start(Duration::from_secs(15)).unwrap();

        assert!(
            scanner
                .on_device_found(&device(Some("Headphones"), &[]), &identity)
                .is_none()
        );
        assert!(scanner.is_scanning());

        let (kind, effects) = scanner
            .on_device_found(&device(Some("ESP32-Motor-7"), &[]), &identity)
            .unwrap();
        assert_eq!(kind, MatchKind::ExactName);
        assert_eq!(
            effects,
            vec![Effect::StopScan, Effect::CancelTimer(TimerKind::ScanTimeout)]
        );
        assert!(!scanner.is_scanning());

        // 第二个候选在扫描停止后到达，被忽略
        assert!(
            scanner
                .on_device_found(&device(Some("ESP32-Motor-8"), &[]), &identity)
                .is_none()
        );
    }

    #[test]
    fn test_stale_timeout_is_noop() {
        let mut scanner = Scanner::new();
        scanner.start(Duration::from_secs(15)).unwrap();
        scanner.stop();
        scanner.start(Duration::from_secs(15)).unwrap();

        assert!(scanner.on_timeout(1).is_none());
        assert!(scanner.is_scanning());
        assert!(scanner.on_timeout(2).is_some());
        assert!(!scanner.is_scanning());
    }

    #[test]
    fn test_scan_failure_ends_session() {
        let mut scanner = Scanner::new();
        scanner.start(Duration::from_secs(15)).unwrap();
        let effects = scanner.on_failed(&ScanFailure::FeatureUnsupported);
        assert!(!scanner.is_scanning());
        assert_eq!(
            effects.last(),
            Some(&Effect::status("Scan failed: Feature unsupported"))
        );
    }
}
