//! Backend selection
//!
//! The backend is chosen once, explicitly, from a [`HostOs`] and the server
//! configuration. Native backends are only present when their feature is
//! compiled for the matching target; asking for one that is not yields
//! [`BlessError::BackendUnavailable`].

use std::fmt;

use bless_core::{
    AdvertisementField, AdvertisementPayload, BlessError, BlessServer, CallbackRegistry,
    Characteristic, Descriptor, GattBackend, GattTree, RequestDispatcher, Result, ServerConfig,
    Service,
};
use tracing::info;

pub use bless_core::BackendKind;

#[cfg(all(target_os = "macos", feature = "corebluetooth"))]
use crate::backends::corebluetooth::CoreBluetoothBackend;
#[cfg(all(target_os = "linux", feature = "bluez"))]
use crate::backends::bluez::BluezBackend;
#[cfg(all(target_os = "windows", feature = "winrt"))]
use crate::backends::{dotnet::DotNetBackend, winrt::WinRtBackend};
use crate::backends::simulated::SimulatedBackend;

// ----------------------------------------------------------------------------
// Host
// ----------------------------------------------------------------------------

/// Operating system family a server runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOs {
    MacOs,
    Linux,
    Windows,
}

impl HostOs {
    /// The host this binary was compiled for
    pub fn current() -> Option<Self> {
        Self::from_identifier(std::env::consts::OS)
    }

    /// Accepts `std::env::consts::OS` values and the `sys.platform` spellings
    pub fn from_identifier(identifier: &str) -> Option<Self> {
        match identifier.to_ascii_lowercase().as_str() {
            "darwin" | "macos" => Some(HostOs::MacOs),
            "linux" => Some(HostOs::Linux),
            "win32" | "windows" => Some(HostOs::Windows),
            _ => None,
        }
    }

    pub fn default_backend(self) -> BackendKind {
        match self {
            HostOs::MacOs => BackendKind::CoreBluetooth,
            HostOs::Linux => BackendKind::BlueZ,
            HostOs::Windows => BackendKind::WinRt,
        }
    }
}

impl fmt::Display for HostOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HostOs::MacOs => "macos",
            HostOs::Linux => "linux",
            HostOs::Windows => "windows",
        })
    }
}

// ----------------------------------------------------------------------------
// Platform Backend
// ----------------------------------------------------------------------------

/// Every backend compiled into this build
pub enum PlatformBackend {
    #[cfg(all(target_os = "macos", feature = "corebluetooth"))]
    CoreBluetooth(CoreBluetoothBackend),
    #[cfg(all(target_os = "linux", feature = "bluez"))]
    BlueZ(BluezBackend),
    #[cfg(all(target_os = "windows", feature = "winrt"))]
    WinRt(WinRtBackend),
    #[cfg(all(target_os = "windows", feature = "winrt"))]
    DotNet(DotNetBackend),
    Simulated(SimulatedBackend),
}

macro_rules! each_backend {
    ($self:expr, $backend:ident => $body:expr) => {
        match $self {
            #[cfg(all(target_os = "macos", feature = "corebluetooth"))]
            PlatformBackend::CoreBluetooth($backend) => $body,
            #[cfg(all(target_os = "linux", feature = "bluez"))]
            PlatformBackend::BlueZ($backend) => $body,
            #[cfg(all(target_os = "windows", feature = "winrt"))]
            PlatformBackend::WinRt($backend) => $body,
            #[cfg(all(target_os = "windows", feature = "winrt"))]
            PlatformBackend::DotNet($backend) => $body,
            PlatformBackend::Simulated($backend) => $body,
        }
    };
}

#[async_trait::async_trait]
impl GattBackend for PlatformBackend {
    fn kind(&self) -> BackendKind {
        each_backend!(self, b => b.kind())
    }

    fn payload_budget(&self) -> Option<usize> {
        each_backend!(self, b => b.payload_budget())
    }

    fn supported_advertisement_fields(&self) -> &'static [AdvertisementField] {
        each_backend!(self, b => b.supported_advertisement_fields())
    }

    async fn wait_for_powered_on(&mut self) -> Result<()> {
        each_backend!(self, b => b.wait_for_powered_on().await)
    }

    async fn add_new_service(&mut self, service: &Service) -> Result<()> {
        each_backend!(self, b => b.add_new_service(service).await)
    }

    async fn add_new_characteristic(
        &mut self,
        service: &Service,
        characteristic: &Characteristic,
    ) -> Result<()> {
        each_backend!(self, b => b.add_new_characteristic(service, characteristic).await)
    }

    async fn add_new_descriptor(
        &mut self,
        characteristic: &Characteristic,
        descriptor: &Descriptor,
    ) -> Result<()> {
        each_backend!(self, b => b.add_new_descriptor(characteristic, descriptor).await)
    }

    async fn register_services(&mut self, services: &[Service]) -> Result<()> {
        each_backend!(self, b => b.register_services(services).await)
    }

    async fn start_advertising(&mut self, payload: &AdvertisementPayload) -> Result<()> {
        each_backend!(self, b => b.start_advertising(payload).await)
    }

    async fn stop_advertising(&mut self) -> Result<()> {
        each_backend!(self, b => b.stop_advertising().await)
    }

    async fn unregister(&mut self) -> Result<()> {
        each_backend!(self, b => b.unregister().await)
    }

    async fn is_advertising(&self) -> Result<bool> {
        each_backend!(self, b => b.is_advertising().await)
    }

    async fn is_connected(&self) -> Result<bool> {
        each_backend!(self, b => b.is_connected().await)
    }

    async fn update_value(&mut self, characteristic: &Characteristic) -> Result<bool> {
        each_backend!(self, b => b.update_value(characteristic).await)
    }
}

// ----------------------------------------------------------------------------
// Factory
// ----------------------------------------------------------------------------

fn unavailable(kind: BackendKind) -> BlessError {
    BlessError::BackendUnavailable {
        backend: kind.to_string(),
    }
}

/// The backend `config` asks for on `host`
pub fn select_backend(host: HostOs, config: &ServerConfig) -> BackendKind {
    config.backend.unwrap_or_else(|| host.default_backend())
}

/// Build the backend for `host`, wired to `dispatcher`
///
/// `config.backend` overrides the host default. Must be called inside a
/// tokio runtime.
pub async fn create_backend(
    host: HostOs,
    config: &ServerConfig,
    dispatcher: RequestDispatcher,
) -> Result<PlatformBackend> {
    let kind = select_backend(host, config);
    info!(%host, backend = %kind, "Selecting backend");

    match kind {
        BackendKind::Simulated => {
            // Nothing drives the central here; use `create_simulated_server`
            // to keep one
            let (backend, _central) = SimulatedBackend::new(dispatcher)?;
            Ok(PlatformBackend::Simulated(backend))
        }
        #[cfg(all(target_os = "macos", feature = "corebluetooth"))]
        BackendKind::CoreBluetooth => Ok(PlatformBackend::CoreBluetooth(
            CoreBluetoothBackend::new(dispatcher)?,
        )),
        #[cfg(all(target_os = "linux", feature = "bluez"))]
        BackendKind::BlueZ => Ok(PlatformBackend::BlueZ(
            BluezBackend::new(&config.name, dispatcher).await?,
        )),
        #[cfg(all(target_os = "windows", feature = "winrt"))]
        BackendKind::WinRt => Ok(PlatformBackend::WinRt(WinRtBackend::new(dispatcher)?)),
        #[cfg(all(target_os = "windows", feature = "winrt"))]
        BackendKind::DotNet => Ok(PlatformBackend::DotNet(DotNetBackend::new(dispatcher)?)),
        #[allow(unreachable_patterns)]
        other => Err(unavailable(other)),
    }
}

/// Validate `config` and build a server on the backend for `host`
pub async fn create_server(host: HostOs, config: ServerConfig) -> Result<BlessServer<PlatformBackend>> {
    config.validate()?;
    let dispatcher = RequestDispatcher::new(GattTree::new(), CallbackRegistry::new());
    let backend = create_backend(host, &config, dispatcher.clone()).await?;
    BlessServer::from_parts(config, dispatcher, backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_identifiers() {
        assert_eq!(HostOs::from_identifier("darwin"), Some(HostOs::MacOs));
        assert_eq!(HostOs::from_identifier("macos"), Some(HostOs::MacOs));
        assert_eq!(HostOs::from_identifier("linux"), Some(HostOs::Linux));
        assert_eq!(HostOs::from_identifier("win32"), Some(HostOs::Windows));
        assert_eq!(HostOs::from_identifier("Windows"), Some(HostOs::Windows));
        assert_eq!(HostOs::from_identifier("freebsd"), None);
    }

    #[test]
    fn test_default_backends() {
        assert_eq!(HostOs::MacOs.default_backend(), BackendKind::CoreBluetooth);
        assert_eq!(HostOs::Linux.default_backend(), BackendKind::BlueZ);
        assert_eq!(HostOs::Windows.default_backend(), BackendKind::WinRt);
    }

    #[test]
    fn test_config_overrides_host_default() {
        let config = ServerConfig::new("bless").with_backend(BackendKind::DotNet);
        assert_eq!(select_backend(HostOs::Windows, &config), BackendKind::DotNet);
        assert_eq!(
            select_backend(HostOs::Windows, &ServerConfig::default()),
            BackendKind::WinRt
        );
    }

    #[tokio::test]
    async fn test_simulated_is_always_available() {
        let config = ServerConfig::new("bless").with_backend(BackendKind::Simulated);
        let server = create_server(HostOs::Linux, config).await.unwrap();
        assert_eq!(server.backend_kind(), BackendKind::Simulated);
    }

    #[cfg(not(all(target_os = "macos", feature = "corebluetooth")))]
    #[tokio::test]
    async fn test_uncompiled_backend_is_unavailable() {
        let config = ServerConfig::new("bless");
        let err = create_server(HostOs::MacOs, config).await.err().unwrap();
        assert!(matches!(
            err,
            BlessError::BackendUnavailable { ref backend } if backend == "corebluetooth"
        ));
    }
}
