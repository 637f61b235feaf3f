//! Ordered service collection owned by one server

use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use super::{Characteristic, Descriptor, GattAttribute, IntoGattUuid, Service};
use crate::errors::{BlessError, Result};
use crate::flags::{GattAttributePermissions, GattCharacteristicProperties, GattDescriptorProperties};

/// The Server→Service→Characteristic→Descriptor hierarchy
///
/// Insertion order is preserved because a service's index decides its
/// primary status and its position in native object paths. Every mutation
/// checks and inserts under one write lock.
#[derive(Debug, Clone, Default)]
pub struct GattTree {
    services: Arc<RwLock<Vec<Service>>>,
}

impl GattTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn services(&self) -> Vec<Service> {
        self.services.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    /// 1-based position of a service, as used in native object paths
    pub fn service_index(&self, uuid: &Uuid) -> Option<usize> {
        self.services
            .read()
            .iter()
            .position(|s| &s.uuid() == uuid)
            .map(|i| i + 1)
    }

    pub fn add_service(&self, uuid: impl IntoGattUuid) -> Result<Service> {
        let uuid = uuid.into_gatt_uuid()?;
        let mut services = self.services.write();
        if services.iter().any(|s| s.uuid() == uuid) {
            return Err(BlessError::DuplicateService {
                uuid: uuid.to_string(),
            });
        }
        let service = Service::new(uuid, services.is_empty());
        services.push(service.clone());
        Ok(service)
    }

    pub fn add_characteristic(
        &self,
        service_uuid: impl IntoGattUuid,
        uuid: impl IntoGattUuid,
        properties: GattCharacteristicProperties,
        permissions: GattAttributePermissions,
        value: Option<Vec<u8>>,
    ) -> Result<Characteristic> {
        let service_uuid = service_uuid.into_gatt_uuid()?;
        let uuid = uuid.into_gatt_uuid()?;
        let services = self.services.write();
        let service = services
            .iter()
            .find(|s| s.uuid() == service_uuid)
            .ok_or_else(|| BlessError::ServiceNotFound {
                uuid: service_uuid.to_string(),
            })?;
        if services.iter().any(|s| s.find_characteristic(&uuid).is_some()) {
            return Err(BlessError::DuplicateCharacteristic {
                uuid: uuid.to_string(),
            });
        }
        let characteristic = Characteristic::new(service_uuid, uuid, properties, permissions, value);
        service.push_characteristic(characteristic.clone());
        Ok(characteristic)
    }

    pub fn add_descriptor(
        &self,
        service_uuid: impl IntoGattUuid,
        characteristic_uuid: impl IntoGattUuid,
        uuid: impl IntoGattUuid,
        properties: GattDescriptorProperties,
        permissions: GattAttributePermissions,
        value: Option<Vec<u8>>,
    ) -> Result<Descriptor> {
        let service_uuid = service_uuid.into_gatt_uuid()?;
        let characteristic_uuid = characteristic_uuid.into_gatt_uuid()?;
        let uuid = uuid.into_gatt_uuid()?;
        let services = self.services.write();
        let service = services
            .iter()
            .find(|s| s.uuid() == service_uuid)
            .ok_or_else(|| BlessError::ServiceNotFound {
                uuid: service_uuid.to_string(),
            })?;
        let characteristic = service
            .find_characteristic(&characteristic_uuid)
            .ok_or_else(|| BlessError::CharacteristicNotFound {
                uuid: characteristic_uuid.to_string(),
            })?;
        if characteristic.get_descriptor(uuid).is_some() {
            return Err(BlessError::DuplicateDescriptor {
                uuid: uuid.to_string(),
            });
        }
        let descriptor = Descriptor::new(characteristic_uuid, uuid, properties, permissions, value);
        characteristic.push_descriptor(descriptor.clone());
        Ok(descriptor)
    }

    pub fn get_service(&self, uuid: impl IntoGattUuid) -> Option<Service> {
        let uuid = uuid.into_gatt_uuid().ok()?;
        self.services.read().iter().find(|s| s.uuid() == uuid).cloned()
    }

    /// First characteristic with this UUID across all services
    pub fn get_characteristic(&self, uuid: impl IntoGattUuid) -> Option<Characteristic> {
        let uuid = uuid.into_gatt_uuid().ok()?;
        self.services
            .read()
            .iter()
            .find_map(|s| s.find_characteristic(&uuid))
    }

    /// First descriptor with this UUID across all characteristics
    pub fn get_descriptor(&self, uuid: impl IntoGattUuid) -> Option<Descriptor> {
        let uuid = uuid.into_gatt_uuid().ok()?;
        self.services.read().iter().find_map(|s| {
            s.characteristics()
                .iter()
                .find_map(|c| c.get_descriptor(uuid))
        })
    }

    /// Characteristics are searched before descriptors
    pub fn find_attribute(&self, uuid: &Uuid) -> Option<GattAttribute> {
        self.get_characteristic(uuid)
            .map(GattAttribute::Characteristic)
            .or_else(|| self.get_descriptor(uuid).map(GattAttribute::Descriptor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: &str = "A07498CA-AD5B-474E-940D-16F1FBE7E8CD";
    const CHARACTERISTIC: &str = "51FF12BB-3ED8-46E5-B4F9-D64E2FEC021B";

    fn rw() -> GattCharacteristicProperties {
        GattCharacteristicProperties::READ | GattCharacteristicProperties::WRITE
    }

    #[test]
    fn test_first_service_is_primary() {
        let tree = GattTree::new();
        let first = tree.add_service(SERVICE).unwrap();
        let second = tree.add_service(0x180Du16).unwrap();
        assert!(first.primary());
        assert!(!second.primary());
        assert_eq!(tree.service_index(&second.uuid()), Some(2));
    }

    #[test]
    fn test_duplicate_service_rejected_across_casing() {
        let tree = GattTree::new();
        tree.add_service(SERVICE).unwrap();
        let err = tree.add_service(SERVICE.to_lowercase()).unwrap_err();
        assert!(matches!(err, BlessError::DuplicateService { .. }));
    }

    #[test]
    fn test_characteristic_requires_known_service() {
        let tree = GattTree::new();
        let err = tree
            .add_characteristic(SERVICE, CHARACTERISTIC, rw(), GattAttributePermissions::READABLE, None)
            .unwrap_err();
        assert!(matches!(err, BlessError::ServiceNotFound { .. }));
    }

    #[test]
    fn test_descriptor_requires_known_characteristic() {
        let tree = GattTree::new();
        tree.add_service(SERVICE).unwrap();
        let err = tree
            .add_descriptor(
                SERVICE,
                CHARACTERISTIC,
                0x2901u16,
                GattDescriptorProperties::READ,
                GattAttributePermissions::READABLE,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, BlessError::CharacteristicNotFound { .. }));
    }

    #[test]
    fn test_find_attribute_resolves_descriptor() {
        let tree = GattTree::new();
        tree.add_service(SERVICE).unwrap();
        tree.add_characteristic(SERVICE, CHARACTERISTIC, rw(), GattAttributePermissions::READABLE, None)
            .unwrap();
        let descriptor = tree
            .add_descriptor(
                SERVICE,
                CHARACTERISTIC,
                0x2901u16,
                GattDescriptorProperties::READ,
                GattAttributePermissions::READABLE,
                Some(b"level".to_vec()),
            )
            .unwrap();

        let found = tree.find_attribute(&descriptor.uuid()).unwrap();
        assert_eq!(found.value(), b"level".to_vec());
        assert!(found.as_descriptor().unwrap().ptr_eq(&descriptor));
    }

    #[test]
    fn test_debug_lists_services() {
        let tree = GattTree::new();
        tree.add_service(SERVICE).unwrap();
        let rendered = format!("{:?}", tree);
        assert!(rendered.starts_with("GattTree"));
        assert!(rendered.contains("primary: true"));
    }
}
