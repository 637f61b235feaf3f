//! Universal GATT property and permission bitsets
//!
//! These are the only flag types an application sees. Each backend translates
//! them into its own vocabulary before creating native objects.

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Characteristic properties as defined by the Core specification
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct GattCharacteristicProperties: u16 {
        const BROADCAST = 0x0001;
        const READ = 0x0002;
        const WRITE_WITHOUT_RESPONSE = 0x0004;
        const WRITE = 0x0008;
        const NOTIFY = 0x0010;
        const INDICATE = 0x0020;
        const AUTHENTICATED_SIGNED_WRITES = 0x0040;
        const EXTENDED_PROPERTIES = 0x0080;
        const RELIABLE_WRITE = 0x0100;
        const WRITABLE_AUXILIARIES = 0x0200;
    }
}

bitflags::bitflags! {
    /// Access permissions attached to a characteristic or descriptor
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct GattAttributePermissions: u8 {
        const READABLE = 0x01;
        const WRITEABLE = 0x02;
        const READ_ENCRYPTION_REQUIRED = 0x04;
        const WRITE_ENCRYPTION_REQUIRED = 0x08;
    }
}

bitflags::bitflags! {
    /// Descriptor properties
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct GattDescriptorProperties: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
    }
}

impl GattCharacteristicProperties {
    /// Whether centrals may subscribe to this characteristic
    pub fn is_subscribable(self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }
}

impl GattAttributePermissions {
    /// Permissions implied by a property set when the caller gives none
    pub fn implied_by(properties: GattCharacteristicProperties) -> Self {
        let mut permissions = Self::empty();
        if properties.contains(GattCharacteristicProperties::READ) {
            permissions |= Self::READABLE;
        }
        if properties.intersects(
            GattCharacteristicProperties::WRITE | GattCharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        ) {
            permissions |= Self::WRITEABLE;
        }
        permissions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_values_match_core_specification() {
        assert_eq!(GattCharacteristicProperties::READ.bits(), 0x02);
        assert_eq!(GattCharacteristicProperties::INDICATE.bits(), 0x20);
        assert_eq!(GattCharacteristicProperties::WRITABLE_AUXILIARIES.bits(), 0x200);
        assert_eq!(GattAttributePermissions::WRITE_ENCRYPTION_REQUIRED.bits(), 0x08);
    }

    #[test]
    fn test_implied_permissions() {
        let props = GattCharacteristicProperties::READ | GattCharacteristicProperties::NOTIFY;
        assert_eq!(
            GattAttributePermissions::implied_by(props),
            GattAttributePermissions::READABLE
        );
        assert!(props.is_subscribable());
    }
}
