//! ATT protocol error codes returned to centrals

use serde::{Deserialize, Serialize};

/// ATT error codes (Core specification Vol 3, Part F, 3.4.1.1)
///
/// CoreBluetooth's `CBATTError` and WinRT's `GattProtocolError` share these
/// numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AttError {
    Success = 0x00,
    InvalidHandle = 0x01,
    ReadNotPermitted = 0x02,
    WriteNotPermitted = 0x03,
    InvalidPdu = 0x04,
    InsufficientAuthentication = 0x05,
    RequestNotSupported = 0x06,
    InvalidOffset = 0x07,
    InsufficientAuthorization = 0x08,
    PrepareQueueFull = 0x09,
    AttributeNotFound = 0x0A,
    AttributeNotLong = 0x0B,
    InsufficientEncryptionKeySize = 0x0C,
    InvalidAttributeValueLength = 0x0D,
    UnlikelyError = 0x0E,
    InsufficientEncryption = 0x0F,
    UnsupportedGroupType = 0x10,
    InsufficientResources = 0x11,
}

impl AttError {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        use AttError::*;
        const ALL: [AttError; 18] = [
            Success,
            InvalidHandle,
            ReadNotPermitted,
            WriteNotPermitted,
            InvalidPdu,
            InsufficientAuthentication,
            RequestNotSupported,
            InvalidOffset,
            InsufficientAuthorization,
            PrepareQueueFull,
            AttributeNotFound,
            AttributeNotLong,
            InsufficientEncryptionKeySize,
            InvalidAttributeValueLength,
            UnlikelyError,
            InsufficientEncryption,
            UnsupportedGroupType,
            InsufficientResources,
        ];
        ALL.get(usize::from(code)).copied()
    }
}

impl std::fmt::Display for AttError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (0x{:02x})", self, self.code())
    }
}
