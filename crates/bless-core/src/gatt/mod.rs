//! GATT value model
//!
//! Plain, backend-agnostic holders for services, characteristics and
//! descriptors. Backends keep their own native handles keyed by UUID; nothing
//! here knows which Bluetooth stack is running.

mod characteristic;
mod descriptor;
mod service;
mod tree;
pub mod uuids;

pub use self::characteristic::Characteristic;
pub use self::descriptor::Descriptor;
pub use self::service::Service;
pub use self::tree::GattTree;
pub use self::uuids::{canonical_uuid, normalize_uuid_str, uuid_from_short, IntoGattUuid};

// ----------------------------------------------------------------------------
// Dispatch Target
// ----------------------------------------------------------------------------

/// The attribute a read or write request resolved to
#[derive(Debug, Clone)]
pub enum GattAttribute {
    Characteristic(Characteristic),
    Descriptor(Descriptor),
}

impl GattAttribute {
    pub fn uuid(&self) -> uuid::Uuid {
        match self {
            GattAttribute::Characteristic(c) => c.uuid(),
            GattAttribute::Descriptor(d) => d.uuid(),
        }
    }

    pub fn value(&self) -> Vec<u8> {
        match self {
            GattAttribute::Characteristic(c) => c.value(),
            GattAttribute::Descriptor(d) => d.value(),
        }
    }

    pub fn set_value(&self, value: impl Into<Vec<u8>>) {
        match self {
            GattAttribute::Characteristic(c) => c.set_value(value),
            GattAttribute::Descriptor(d) => d.set_value(value),
        }
    }

    pub fn as_characteristic(&self) -> Option<&Characteristic> {
        match self {
            GattAttribute::Characteristic(c) => Some(c),
            GattAttribute::Descriptor(_) => None,
        }
    }

    pub fn as_descriptor(&self) -> Option<&Descriptor> {
        match self {
            GattAttribute::Descriptor(d) => Some(d),
            GattAttribute::Characteristic(_) => None,
        }
    }
}
