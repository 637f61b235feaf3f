//! UUID canonicalization
//!
//! Every lookup boundary goes through [`IntoGattUuid`], so a UUID given in
//! upper case, without hyphens, braced, or as a 16/32-bit short form always
//! resolves to the same attribute.

use uuid::Uuid;

use crate::errors::{BlessError, Result};

/// The Bluetooth base UUID `00000000-0000-1000-8000-00805f9b34fb`
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16 or 32-bit assigned number against the Bluetooth base UUID
pub const fn uuid_from_short(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Returns the 16-bit short form when `uuid` is derived from the base UUID
pub fn short_form(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let mask = (1u128 << 96) - 1;
    if value & mask != BLUETOOTH_BASE_UUID & mask {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

/// Normalize a textual UUID to its canonical value
pub fn normalize_uuid_str(input: &str) -> Result<Uuid> {
    let trimmed = input.trim();
    let is_short = trimmed.len() <= 8 && trimmed.chars().all(|c| c.is_ascii_hexdigit());
    if is_short && !trimmed.is_empty() {
        let short = u32::from_str_radix(trimmed, 16).map_err(|_| BlessError::InvalidUuid {
            input: input.to_string(),
        })?;
        return Ok(uuid_from_short(short));
    }

    Uuid::parse_str(trimmed).map_err(|_| BlessError::InvalidUuid {
        input: input.to_string(),
    })
}

/// Canonical lowercase hyphenated string for any accepted input
pub fn canonical_uuid(input: impl IntoGattUuid) -> Result<String> {
    Ok(input.into_gatt_uuid()?.to_string())
}

/// Anything that can name a GATT attribute
pub trait IntoGattUuid {
    fn into_gatt_uuid(self) -> Result<Uuid>;
}

impl IntoGattUuid for Uuid {
    fn into_gatt_uuid(self) -> Result<Uuid> {
        Ok(self)
    }
}

impl IntoGattUuid for &Uuid {
    fn into_gatt_uuid(self) -> Result<Uuid> {
        Ok(*self)
    }
}

impl IntoGattUuid for &str {
    fn into_gatt_uuid(self) -> Result<Uuid> {
        normalize_uuid_str(self)
    }
}

impl IntoGattUuid for String {
    fn into_gatt_uuid(self) -> Result<Uuid> {
        normalize_uuid_str(&self)
    }
}

impl IntoGattUuid for &String {
    fn into_gatt_uuid(self) -> Result<Uuid> {
        normalize_uuid_str(self)
    }
}

impl IntoGattUuid for u16 {
    fn into_gatt_uuid(self) -> Result<Uuid> {
        Ok(uuid_from_short(u32::from(self)))
    }
}
