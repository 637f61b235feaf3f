//! GATT flags → `GattCharacteristicProperties` / `GattProtectionLevel`

use bless_core::{GattAttributePermissions, GattCharacteristicProperties};

/// `GattProtectionLevel`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionLevel {
    Plain,
    EncryptionRequired,
}

impl ProtectionLevel {
    pub fn value(self) -> i32 {
        match self {
            ProtectionLevel::Plain => 0,
            ProtectionLevel::EncryptionRequired => 2,
        }
    }
}

/// WinRT uses the same bit values, reliable writes and auxiliaries included
pub fn translate_properties(properties: GattCharacteristicProperties) -> u32 {
    u32::from(properties.bits())
}

pub fn read_protection(permissions: GattAttributePermissions) -> ProtectionLevel {
    if permissions.contains(GattAttributePermissions::READ_ENCRYPTION_REQUIRED) {
        ProtectionLevel::EncryptionRequired
    } else {
        ProtectionLevel::Plain
    }
}

pub fn write_protection(permissions: GattAttributePermissions) -> ProtectionLevel {
    if permissions.contains(GattAttributePermissions::WRITE_ENCRYPTION_REQUIRED) {
        ProtectionLevel::EncryptionRequired
    } else {
        ProtectionLevel::Plain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_pass_through() {
        let props = GattCharacteristicProperties::READ
            | GattCharacteristicProperties::INDICATE
            | GattCharacteristicProperties::RELIABLE_WRITE;
        assert_eq!(translate_properties(props), 0x0002 | 0x0020 | 0x0100);
    }

    #[test]
    fn test_protection_levels_are_independent() {
        let perms = GattAttributePermissions::READABLE
            | GattAttributePermissions::WRITEABLE
            | GattAttributePermissions::WRITE_ENCRYPTION_REQUIRED;
        assert_eq!(read_protection(perms), ProtectionLevel::Plain);
        assert_eq!(write_protection(perms), ProtectionLevel::EncryptionRequired);
    }
}
