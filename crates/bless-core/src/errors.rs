//! Error types for the bless GATT server
//!
//! `BlessError` is the single error type returned across the façade. Failures
//! reported by a native Bluetooth stack are wrapped in [`BackendError`] so the
//! caller can tell configuration mistakes apart from platform failures.

use std::time::Duration;

use crate::state::ServerState;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures raised by a native peripheral manager or its bindings
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Failed to add service {uuid}: {reason}")]
    AddServiceFailed { uuid: String, reason: String },
    #[error("Failed to start advertising: {reason}")]
    AdvertisingFailed { reason: String },
    #[error("Failed to register GATT application: {reason}")]
    Registration { reason: String },
    #[error("Message bus error: {reason}")]
    Bus { reason: String },
    #[error("Bluetooth adapter not available: {reason}")]
    AdapterUnavailable { reason: String },
    #[error("Native call {operation} failed: {reason}")]
    Native { operation: String, reason: String },
    #[error("Event pump for {backend} has shut down")]
    PumpClosed { backend: String },
}

impl BackendError {
    /// Shorthand for a failed native call
    pub fn native(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Native {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

/// Which request callback slot an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Read,
    Write,
}

impl std::fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallbackKind::Read => write!(f, "Read"),
            CallbackKind::Write => write!(f, "Write"),
        }
    }
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Main error type for the bless crates
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlessError {
    #[error("Server: {kind} Callback is undefined")]
    CallbackUndefined { kind: CallbackKind },

    #[error("Invalid UUID: {input}")]
    InvalidUuid { input: String },

    #[error("Service already exists: {uuid}")]
    DuplicateService { uuid: String },

    #[error("Characteristic already exists: {uuid}")]
    DuplicateCharacteristic { uuid: String },

    #[error("Descriptor already exists: {uuid}")]
    DuplicateDescriptor { uuid: String },

    #[error("Service not found: {uuid}")]
    ServiceNotFound { uuid: String },

    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound { uuid: String },

    #[error("Invalid characteristic: {uuid}")]
    DispatchMiss { uuid: String },

    #[error("Bluetooth was not powered on within {timeout:?}")]
    PoweredOnTimeout { timeout: Duration },

    #[error("Advertising did not start within {timeout:?}")]
    AdvertisingTimeout { timeout: Duration },

    #[error("Cannot {operation} while server is {state}")]
    InvalidState {
        operation: &'static str,
        state: ServerState,
    },

    #[error("Backend {backend} is not available in this build")]
    BackendUnavailable { backend: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

impl BlessError {
    /// Whether the start sequence may be retried after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, BlessError::AdvertisingTimeout { .. })
    }
}

/// Result type used throughout the bless crates
pub type Result<T> = std::result::Result<T, BlessError>;
