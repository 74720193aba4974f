//! GATT 特征解析与写入路径

use btleplug::api::{CharPropFlags, WriteType};
use log::debug;

use crate::ble::{ResolvedCharacteristic, ServiceInfo, TargetIdentity, VIBRATE_COMMAND};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

impl From<WriteKind> for WriteType {
    fn from(kind: WriteKind) -> Self {
        match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        }
    }
}

/// 待发送的命令文本，每次发送时重新构造
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn vibrate() -> Self {
        Self::new(VIBRATE_COMMAND)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// 按 UTF-8 编码的原始字节
    pub fn payload(&self) -> Vec<u8> {
        self.text.as_bytes().to_vec()
    }
}

/// 确定了写入方式的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub payload: Vec<u8>,
    pub kind: WriteKind,
}

/// 根据特征能力选择写入方式：优先带响应写入
pub fn select_write_kind(properties: CharPropFlags) -> Option<WriteKind> {
    if properties.contains(CharPropFlags::WRITE) {
        Some(WriteKind::WithResponse)
    } else if properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
        Some(WriteKind::WithoutResponse)
    } else {
        None
    }
}

/// 特征不可写时返回 `None`，此时不应发出任何写请求
pub fn prepare_write(
    characteristic: &ResolvedCharacteristic,
    command: &Command,
) -> Option<WriteRequest> {
    let kind = select_write_kind(characteristic.properties)?;
    Some(WriteRequest {
        payload: command.payload(),
        kind,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionFailure {
    #[error("Service not found")]
    ServiceNotFound,

    #[error("Characteristic not found")]
    CharacteristicNotFound,
}

/// 在发现的服务表中查找目标服务和特征
pub fn resolve_target(
    services: &[ServiceInfo],
    identity: &TargetIdentity,
) -> Result<ResolvedCharacteristic, ResolutionFailure> {
    for service in services {
        debug!("Found service: {}", service.uuid);
        for characteristic in &service.characteristics {
            debug!(
                "  - Characteristic: {} (Properties: {:?})",
                characteristic.uuid, characteristic.properties
            );
        }
    }

    let service = services
        .iter()
        .find(|s| s.uuid == identity.service_uuid)
        .ok_or(ResolutionFailure::ServiceNotFound)?;

    let characteristic = service
        .characteristics
        .iter()
        .find(|c| c.uuid == identity.characteristic_uuid)
        .ok_or(ResolutionFailure::CharacteristicNotFound)?;

    debug!(
        "Target characteristic {} can write: {}, can write no response: {}",
        characteristic.uuid,
        characteristic.properties.contains(CharPropFlags::WRITE),
        characteristic
            .properties
            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
    );

    Ok(ResolvedCharacteristic {
        service_uuid: service.uuid,
        uuid: characteristic.uuid,
        properties: characteristic.properties,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{CHARACTERISTIC_UUID, CharacteristicInfo, SERVICE_UUID};
    use uuid::Uuid;

    fn target_service(properties: CharPropFlags) -> ServiceInfo {
        ServiceInfo {
            uuid: SERVICE_UUID,
            characteristics: vec![CharacteristicInfo {
                uuid: CHARACTERISTIC_UUID,
                properties,
            }],
        }
    }

    #[test]
    fn test_write_kind_prefers_with_response() {
        let both = CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE;
        assert_eq!(select_write_kind(both), Some(WriteKind::WithResponse));
        assert_eq!(
            select_write_kind(CharPropFlags::WRITE_WITHOUT_RESPONSE | CharPropFlags::READ),
            Some(WriteKind::WithoutResponse)
        );
        assert_eq!(select_write_kind(CharPropFlags::READ | CharPropFlags::NOTIFY), None);
    }

    #[test]
    fn test_write_kind_is_stable_for_every_mask() {
        for bits in 0..=u8::MAX {
            let props = CharPropFlags::from_bits_truncate(bits);
            assert_eq!(select_write_kind(props), select_write_kind(props));
        }
    }

    #[test]
    fn test_prepare_write_encodes_utf8() {
        let characteristic = ResolvedCharacteristic {
            service_uuid: SERVICE_UUID,
            uuid: CHARACTERISTIC_UUID,
            properties: CharPropFlags::WRITE_WITHOUT_RESPONSE,
        };
        let request = prepare_write(&characteristic, &Command::vibrate()).unwrap();
        assert_eq!(request.payload, b"vibrate".to_vec());
        assert_eq!(request.kind, WriteKind::WithoutResponse);

        let read_only = ResolvedCharacteristic {
            properties: CharPropFlags::READ,
            ..characteristic
        };
        assert!(prepare_write(&read_only, &Command::vibrate()).is_none());
    }

    #[test]
    fn test_resolve_target() {
        let identity = TargetIdentity::default();
        let services = vec![
            ServiceInfo {
                uuid: Uuid::from_u128(0x1800),
                characteristics: vec![],
            },
            target_service(CharPropFlags::WRITE),
        ];

        let resolved = resolve_target(&services, &identity).unwrap();
        assert_eq!(resolved.uuid, CHARACTERISTIC_UUID);
        assert_eq!(resolved.service_uuid, SERVICE_UUID);
        assert_eq!(resolved.properties, CharPropFlags::WRITE);
    }

    #[test]
    fn test_resolve_target_failures() {
        let identity = TargetIdentity::default();
        assert_eq!(
            resolve_target(&[], &identity),
            Err(ResolutionFailure::ServiceNotFound)
        );

        let wrong_char = ServiceInfo {
            uuid: SERVICE_UUID,
            characteristics: vec![CharacteristicInfo {
                uuid: Uuid::from_u128(0x2a00),
                properties: CharPropFlags::WRITE,
            }],
        };
        assert_eq!(
            resolve_target(&[wrong_char], &identity),
            Err(ResolutionFailure::CharacteristicNotFound)
        );
    }
}
