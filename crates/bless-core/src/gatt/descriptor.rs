//! GATT descriptor handle

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::flags::{GattAttributePermissions, GattDescriptorProperties};

/// A descriptor owned by a [`Characteristic`](super::Characteristic)
#[derive(Clone)]
pub struct Descriptor {
    inner: Arc<DescriptorInner>,
}

struct DescriptorInner {
    uuid: Uuid,
    characteristic_uuid: Uuid,
    properties: GattDescriptorProperties,
    permissions: GattAttributePermissions,
    value: RwLock<Vec<u8>>,
}

impl Descriptor {
    pub(crate) fn new(
        characteristic_uuid: Uuid,
        uuid: Uuid,
        properties: GattDescriptorProperties,
        permissions: GattAttributePermissions,
        value: Option<Vec<u8>>,
    ) -> Self {
        Self {
            inner: Arc::new(DescriptorInner {
                uuid,
                characteristic_uuid,
                properties,
                permissions,
                value: RwLock::new(value.unwrap_or_default()),
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn characteristic_uuid(&self) -> Uuid {
        self.inner.characteristic_uuid
    }

    pub fn properties(&self) -> GattDescriptorProperties {
        self.inner.properties
    }

    pub fn permissions(&self) -> GattAttributePermissions {
        self.inner.permissions
    }

    pub fn value(&self) -> Vec<u8> {
        self.inner.value.read().clone()
    }

    pub fn set_value(&self, value: impl Into<Vec<u8>>) {
        *self.inner.value.write() = value.into();
    }

    pub fn ptr_eq(&self, other: &Descriptor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("uuid", &self.inner.uuid)
            .field("characteristic_uuid", &self.inner.characteristic_uuid)
            .field("properties", &self.inner.properties)
            .field("value", &hex::encode(&*self.inner.value.read()))
            .finish()
    }
}
