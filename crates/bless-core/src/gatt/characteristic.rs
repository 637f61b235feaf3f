//! GATT characteristic handle

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use super::descriptor::Descriptor;
use super::uuids::IntoGattUuid;
use crate::flags::{GattAttributePermissions, GattCharacteristicProperties};

/// A characteristic owned by a [`Service`](super::Service)
///
/// Cloning yields another handle to the same attribute, so a value written by
/// the dispatch path is visible to every holder. The value has its own lock;
/// reads and writes never block on the rest of the tree.
#[derive(Clone)]
pub struct Characteristic {
    inner: Arc<CharacteristicInner>,
}

struct CharacteristicInner {
    uuid: Uuid,
    service_uuid: Uuid,
    properties: GattCharacteristicProperties,
    permissions: GattAttributePermissions,
    value: RwLock<Vec<u8>>,
    descriptors: RwLock<Vec<Descriptor>>,
}

impl Characteristic {
    pub(crate) fn new(
        service_uuid: Uuid,
        uuid: Uuid,
        properties: GattCharacteristicProperties,
        permissions: GattAttributePermissions,
        value: Option<Vec<u8>>,
    ) -> Self {
        Self {
            inner: Arc::new(CharacteristicInner {
                uuid,
                service_uuid,
                properties,
                permissions,
                value: RwLock::new(value.unwrap_or_default()),
                descriptors: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// UUID of the owning service
    pub fn service_uuid(&self) -> Uuid {
        self.inner.service_uuid
    }

    pub fn properties(&self) -> GattCharacteristicProperties {
        self.inner.properties
    }

    pub fn permissions(&self) -> GattAttributePermissions {
        self.inner.permissions
    }

    /// Snapshot of the current value
    pub fn value(&self) -> Vec<u8> {
        self.inner.value.read().clone()
    }

    /// Replace the value; subscribers are not notified until `update_value`
    pub fn set_value(&self, value: impl Into<Vec<u8>>) {
        *self.inner.value.write() = value.into();
    }

    /// Descriptors in registration order
    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.inner.descriptors.read().clone()
    }

    pub fn get_descriptor(&self, uuid: impl IntoGattUuid) -> Option<Descriptor> {
        let uuid = uuid.into_gatt_uuid().ok()?;
        self.inner
            .descriptors
            .read()
            .iter()
            .find(|d| d.uuid() == uuid)
            .cloned()
    }

    /// Whether both handles refer to the same attribute
    pub fn ptr_eq(&self, other: &Characteristic) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn push_descriptor(&self, descriptor: Descriptor) {
        self.inner.descriptors.write().push(descriptor);
    }
}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("uuid", &self.inner.uuid)
            .field("service_uuid", &self.inner.service_uuid)
            .field("properties", &self.inner.properties)
            .field("permissions", &self.inner.permissions)
            .field("value", &hex::encode(&*self.inner.value.read()))
            .field("descriptors", &self.inner.descriptors.read().len())
            .finish()
    }
}
