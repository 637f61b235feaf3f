//! Native BLE peripheral backends for the bless GATT server
//!
//! This crate implements [`bless_core::GattBackend`] for each native stack and
//! picks one for the host at runtime.
//!
//! ## Architecture
//!
//! - [`bridge`] - Event sink and pump shared by every adapter
//! - [`backends`] - CoreBluetooth, BlueZ, WinRT, DotNet and simulated adapters
//! - [`platform`] - Host detection, the [`PlatformBackend`] enum and the factory
//!
//! Native stacks are behind the `corebluetooth`, `bluez` and `winrt`
//! features. Without them only the simulated backend can be created.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use bless_ble::{create_server, HostOs};
//! use bless_core::{GattAttributePermissions, GattCharacteristicProperties, ServerConfig};
//!
//! # async fn example() -> bless_core::Result<()> {
//! let host = HostOs::current().expect("supported host");
//! let server = create_server(host, ServerConfig::new("Test Service")).await?;
//! server.set_read_request_func(|attr, _ctx| attr.value());
//! server.set_write_request_func(|attr, value, _ctx| attr.set_value(value));
//!
//! server.add_new_service("A07498CA-AD5B-474E-940D-16F1FBE7E8CD").await?;
//! server
//!     .add_new_characteristic(
//!         "A07498CA-AD5B-474E-940D-16F1FBE7E8CD",
//!         "51FF12BB-3ED8-46E5-B4F9-D64E2FEC021B",
//!         GattCharacteristicProperties::READ | GattCharacteristicProperties::WRITE,
//!         None,
//!         GattAttributePermissions::READABLE | GattAttributePermissions::WRITEABLE,
//!     )
//!     .await?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod bridge;
pub mod platform;

pub use backends::{
    create_simulated_server, BluezBackend, CoreBluetoothBackend, DotNetBackend, SimulatedBackend,
    SimulatedCentral, WinRtBackend,
};
pub use bridge::{spawn_pump, EventSink};
pub use platform::{create_backend, create_server, select_backend, BackendKind, HostOs, PlatformBackend};
