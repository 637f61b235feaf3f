//! Backend-agnostic core of the bless GATT peripheral server
//!
//! This crate holds everything that does not depend on a native Bluetooth
//! stack. Backend adapters live in `bless-ble` and plug in through
//! [`GattBackend`].
//!
//! ## Architecture
//!
//! - [`gatt`] - Services, characteristics, descriptors and UUID normalization
//! - [`flags`] - Universal property and permission bitsets
//! - [`dispatch`] - Callback registry and request routing
//! - [`subscriptions`] - Central subscription tracking
//! - [`state`] - Lifecycle state machine
//! - [`advertisement`] - Advertisement data and payload budgeting
//! - [`backend`] - The adapter trait
//! - [`server`] - The [`BlessServer`] façade
//!
//! ## Usage
//!
//! ```rust,ignore
//! let server = BlessServer::new(ServerConfig::new("Test Service"), build_backend)?;
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
//! ```

pub mod advertisement;
pub mod att;
pub mod backend;
pub mod config;
pub mod definition;
pub mod dispatch;
pub mod errors;
pub mod flags;
pub mod gatt;
pub mod server;
pub mod state;
pub mod subscriptions;

pub use advertisement::{AdvertisementData, AdvertisementField, AdvertisementPayload, LEGACY_PAYLOAD_BUDGET};
pub use att::AttError;
pub use backend::{BackendKind, GattBackend};
pub use config::ServerConfig;
pub use definition::{CharacteristicDefinition, DescriptorDefinition, GattDefinition, ServiceDefinition};
pub use dispatch::{CallbackRegistry, FaultSlot, RequestContext, RequestDispatcher};
pub use errors::{BackendError, BlessError, CallbackKind, Result};
pub use flags::{GattAttributePermissions, GattCharacteristicProperties, GattDescriptorProperties};
pub use gatt::{
    canonical_uuid, normalize_uuid_str, uuid_from_short, Characteristic, Descriptor, GattAttribute,
    GattTree, IntoGattUuid, Service,
};
pub use server::{BlessServer, ServeGuard};
pub use state::{ServerState, StateEvent, StateMachine};
pub use subscriptions::SubscriptionSet;
