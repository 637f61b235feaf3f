//! GATT flags → BlueZ `Flags` string tokens

use bless_core::{GattAttributePermissions, GattCharacteristicProperties, GattDescriptorProperties};
use smallvec::SmallVec;

/// Flag tokens for one attribute, in table order
pub type FlagList = SmallVec<[&'static str; 8]>;

const CHARACTERISTIC_TABLE: [(GattCharacteristicProperties, &str); 10] = [
    (GattCharacteristicProperties::BROADCAST, "broadcast"),
    (GattCharacteristicProperties::READ, "read"),
    (GattCharacteristicProperties::WRITE_WITHOUT_RESPONSE, "write-without-response"),
    (GattCharacteristicProperties::WRITE, "write"),
    (GattCharacteristicProperties::NOTIFY, "notify"),
    (GattCharacteristicProperties::INDICATE, "indicate"),
    (GattCharacteristicProperties::AUTHENTICATED_SIGNED_WRITES, "authenticated-signed-writes"),
    (GattCharacteristicProperties::EXTENDED_PROPERTIES, "extended-properties"),
    (GattCharacteristicProperties::RELIABLE_WRITE, "reliable-write"),
    (GattCharacteristicProperties::WRITABLE_AUXILIARIES, "writable-auxiliaries"),
];

fn encrypted(token: &'static str, permissions: GattAttributePermissions) -> &'static str {
    match token {
        "read" if permissions.contains(GattAttributePermissions::READ_ENCRYPTION_REQUIRED) => {
            "encrypt-read"
        }
        "write" if permissions.contains(GattAttributePermissions::WRITE_ENCRYPTION_REQUIRED) => {
            "encrypt-write"
        }
        other => other,
    }
}

pub fn characteristic_flags(
    properties: GattCharacteristicProperties,
    permissions: GattAttributePermissions,
) -> FlagList {
    CHARACTERISTIC_TABLE
        .iter()
        .filter(|(flag, _)| properties.contains(*flag))
        .map(|(_, token)| encrypted(token, permissions))
        .collect()
}

pub fn descriptor_flags(
    properties: GattDescriptorProperties,
    permissions: GattAttributePermissions,
) -> FlagList {
    let mut flags = FlagList::new();
    if properties.contains(GattDescriptorProperties::READ) {
        flags.push(encrypted("read", permissions));
    }
    if properties.contains(GattDescriptorProperties::WRITE) {
        flags.push(encrypted("write", permissions));
    }
    flags
}
