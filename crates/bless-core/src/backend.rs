//! Backend adapter trait
//!
//! Each native peripheral stack sits behind one [`GattBackend`]. The server
//! façade owns timeouts, retries and state; a backend only materializes GATT
//! objects and reports what the native layer did.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::advertisement::{AdvertisementField, AdvertisementPayload};
use crate::errors::Result;
use crate::gatt::{Characteristic, Descriptor, Service};

/// Available backend implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// macOS CoreBluetooth `CBPeripheralManager`
    CoreBluetooth,
    /// Linux BlueZ over D-Bus
    BlueZ,
    /// Windows `GattServiceProvider` through WinRT projections
    WinRt,
    /// Windows UWP GATT server through the legacy .NET bridge
    DotNet,
    /// In-process peripheral with no radio
    Simulated,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::CoreBluetooth => "corebluetooth",
            BackendKind::BlueZ => "bluez",
            BackendKind::WinRt => "winrt",
            BackendKind::DotNet => "dotnet",
            BackendKind::Simulated => "simulated",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Backend Trait
// ----------------------------------------------------------------------------

/// Capability set every native adapter implements
///
/// Methods taking `&mut self` are only called with the façade's backend lock
/// held, so registration and start/stop never interleave. The two waiting
/// methods are cancelled by the façade on timeout and must tolerate being
/// dropped mid-await.
#[async_trait::async_trait]
pub trait GattBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Byte budget for the local name and service UUIDs, if the stack has one
    fn payload_budget(&self) -> Option<usize> {
        None
    }

    /// Advertisement fields the native stack can express
    fn supported_advertisement_fields(&self) -> &'static [AdvertisementField];

    /// Resolve once the radio reports powered on
    async fn wait_for_powered_on(&mut self) -> Result<()>;

    async fn add_new_service(&mut self, service: &Service) -> Result<()>;

    async fn add_new_characteristic(
        &mut self,
        service: &Service,
        characteristic: &Characteristic,
    ) -> Result<()>;

    async fn add_new_descriptor(
        &mut self,
        characteristic: &Characteristic,
        descriptor: &Descriptor,
    ) -> Result<()>;

    /// Push every service to the native stack, one at a time, awaiting each
    async fn register_services(&mut self, services: &[Service]) -> Result<()>;

    /// Request advertising and resolve once the native layer confirms it
    async fn start_advertising(&mut self, payload: &AdvertisementPayload) -> Result<()>;

    async fn stop_advertising(&mut self) -> Result<()>;

    /// Clear native registration so the start sequence can run again
    async fn unregister(&mut self) -> Result<()>;

    async fn is_advertising(&self) -> Result<bool>;

    /// Whether any central holds a subscription
    async fn is_connected(&self) -> Result<bool>;

    /// Push the characteristic's current value to subscribers
    async fn update_value(&mut self, characteristic: &Characteristic) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_names() {
        assert_eq!(BackendKind::DotNet.to_string(), "dotnet");
        let parsed: BackendKind = serde_json::from_str("\"bluez\"").unwrap();
        assert_eq!(parsed, BackendKind::BlueZ);
    }
}
