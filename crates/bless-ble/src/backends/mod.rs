//! Backend adapters
//!
//! Each adapter translates between the bless GATT model and one native stack.
//! The portable half of every adapter (flag translation, event handling,
//! request routing) is always compiled and tested against fake drivers; the
//! `native` submodules that talk to the OS are gated on target and feature.

pub mod bluez;
pub mod corebluetooth;
pub mod dotnet;
pub mod simulated;
pub mod winrt;

pub use bluez::BluezBackend;
pub use corebluetooth::CoreBluetoothBackend;
pub use dotnet::DotNetBackend;
pub use simulated::{create_simulated_server, SimulatedBackend, SimulatedCentral};
pub use winrt::WinRtBackend;
