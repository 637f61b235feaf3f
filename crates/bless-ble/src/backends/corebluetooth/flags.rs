//! GATT flags → `CBCharacteristicProperties` / `CBAttributePermissions`

use bless_core::{GattAttributePermissions, GattCharacteristicProperties};
use tracing::debug;

/// `CBCharacteristicProperties` values
pub mod cb_properties {
    pub const BROADCAST: usize = 0x01;
    pub const READ: usize = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: usize = 0x04;
    pub const WRITE: usize = 0x08;
    pub const NOTIFY: usize = 0x10;
    pub const INDICATE: usize = 0x20;
    pub const AUTHENTICATED_SIGNED_WRITES: usize = 0x40;
    pub const EXTENDED_PROPERTIES: usize = 0x80;
}

/// `CBAttributePermissions` values
pub mod cb_permissions {
    pub const READABLE: usize = 0x01;
    pub const WRITEABLE: usize = 0x02;
    pub const READ_ENCRYPTION_REQUIRED: usize = 0x04;
    pub const WRITE_ENCRYPTION_REQUIRED: usize = 0x08;
}

const PROPERTY_TABLE: [(GattCharacteristicProperties, usize); 8] = [
    (GattCharacteristicProperties::BROADCAST, cb_properties::BROADCAST),
    (GattCharacteristicProperties::READ, cb_properties::READ),
    (
        GattCharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        cb_properties::WRITE_WITHOUT_RESPONSE,
    ),
    (GattCharacteristicProperties::WRITE, cb_properties::WRITE),
    (GattCharacteristicProperties::NOTIFY, cb_properties::NOTIFY),
    (GattCharacteristicProperties::INDICATE, cb_properties::INDICATE),
    (
        GattCharacteristicProperties::AUTHENTICATED_SIGNED_WRITES,
        cb_properties::AUTHENTICATED_SIGNED_WRITES,
    ),
    (
        GattCharacteristicProperties::EXTENDED_PROPERTIES,
        cb_properties::EXTENDED_PROPERTIES,
    ),
];

/// Properties CoreBluetooth has no bit for; they belong in the
/// extended-properties descriptor, which the stack manages itself
const UNSUPPORTED_PROPERTIES: GattCharacteristicProperties = GattCharacteristicProperties::RELIABLE_WRITE
    .union(GattCharacteristicProperties::WRITABLE_AUXILIARIES);

pub fn translate_properties(properties: GattCharacteristicProperties) -> usize {
    let dropped = properties & UNSUPPORTED_PROPERTIES;
    if !dropped.is_empty() {
        debug!(?dropped, "No CoreBluetooth property for flags; dropped");
    }
    PROPERTY_TABLE
        .iter()
        .filter(|(flag, _)| properties.contains(*flag))
        .fold(0, |bits, (_, native)| bits | native)
}

/// Readable/writeable are promoted to their encrypted variants when required
pub fn translate_permissions(permissions: GattAttributePermissions) -> usize {
    let mut bits = 0;
    if permissions.contains(GattAttributePermissions::READ_ENCRYPTION_REQUIRED) {
        bits |= cb_permissions::READ_ENCRYPTION_REQUIRED;
    } else if permissions.contains(GattAttributePermissions::READABLE) {
        bits |= cb_permissions::READABLE;
    }
    if permissions.contains(GattAttributePermissions::WRITE_ENCRYPTION_REQUIRED) {
        bits |= cb_permissions::WRITE_ENCRYPTION_REQUIRED;
    } else if permissions.contains(GattAttributePermissions::WRITEABLE) {
        bits |= cb_permissions::WRITEABLE;
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reliable_write_is_dropped() {
        let props = GattCharacteristicProperties::READ
            | GattCharacteristicProperties::RELIABLE_WRITE
            | GattCharacteristicProperties::WRITABLE_AUXILIARIES;
        assert_eq!(translate_properties(props), cb_properties::READ);
    }

    #[test]
    fn test_permission_promotion() {
        let perms = GattAttributePermissions::READABLE
            | GattAttributePermissions::WRITEABLE
            | GattAttributePermissions::READ_ENCRYPTION_REQUIRED;
        assert_eq!(
            translate_permissions(perms),
            cb_permissions::READ_ENCRYPTION_REQUIRED | cb_permissions::WRITEABLE
        );
    }

    proptest! {
        #[test]
        fn low_property_bits_pass_through(bits in 0u16..0x100) {
            let props = GattCharacteristicProperties::from_bits_truncate(bits);
            prop_assert_eq!(translate_properties(props), bits as usize);
        }
    }
}
