//! Advertisement data and payload budgeting
//!
//! A legacy advertising PDU carries 31 bytes; after the mandatory flags field
//! 28 remain for the local name and the service UUID list. When both do not
//! fit, one of them is dropped whole rather than truncating the name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::gatt::uuids::short_form;

/// Bytes available for name and service UUIDs in a legacy advertisement
pub const LEGACY_PAYLOAD_BUDGET: usize = 28;

/// Length + type header of one AD structure
const AD_HEADER_LEN: usize = 2;

// ----------------------------------------------------------------------------
// Advertisement Data
// ----------------------------------------------------------------------------

/// Optional advertisement fields supplied by the application
///
/// Service UUIDs default to every registered service when left empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertisementData {
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    pub is_connectable: Option<bool>,
    pub is_discoverable: Option<bool>,
    pub tx_power: Option<i16>,
}

impl AdvertisementData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    pub fn with_service_uuid(mut self, uuid: Uuid) -> Self {
        self.service_uuids.push(uuid);
        self
    }

    pub fn with_manufacturer_data(mut self, company: u16, data: Vec<u8>) -> Self {
        self.manufacturer_data.insert(company, data);
        self
    }

    pub fn with_service_data(mut self, uuid: Uuid, data: Vec<u8>) -> Self {
        self.service_data.insert(uuid, data);
        self
    }

    pub fn with_connectable(mut self, connectable: bool) -> Self {
        self.is_connectable = Some(connectable);
        self
    }

    pub fn with_discoverable(mut self, discoverable: bool) -> Self {
        self.is_discoverable = Some(discoverable);
        self
    }

    pub fn with_tx_power(mut self, tx_power: i16) -> Self {
        self.tx_power = Some(tx_power);
        self
    }

    /// Fields that are set
    pub fn present_fields(&self) -> Vec<AdvertisementField> {
        let mut fields = Vec::new();
        if self.local_name.is_some() {
            fields.push(AdvertisementField::LocalName);
        }
        if !self.service_uuids.is_empty() {
            fields.push(AdvertisementField::ServiceUuids);
        }
        if !self.manufacturer_data.is_empty() {
            fields.push(AdvertisementField::ManufacturerData);
        }
        if !self.service_data.is_empty() {
            fields.push(AdvertisementField::ServiceData);
        }
        if self.is_connectable.is_some() {
            fields.push(AdvertisementField::Connectable);
        }
        if self.is_discoverable.is_some() {
            fields.push(AdvertisementField::Discoverable);
        }
        if self.tx_power.is_some() {
            fields.push(AdvertisementField::TxPower);
        }
        fields
    }

    /// Log a warning for every set field the backend cannot express
    pub fn warn_unsupported(&self, backend: &str, supported: &[AdvertisementField]) {
        for field in self.present_fields() {
            if !supported.contains(&field) {
                warn!(backend, ?field, "Advertisement field is not supported and will be ignored");
            }
        }
    }
}

/// Individual advertisement fields, used for backend capability lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdvertisementField {
    LocalName,
    ServiceUuids,
    ManufacturerData,
    ServiceData,
    Connectable,
    Discoverable,
    TxPower,
}

// ----------------------------------------------------------------------------
// Payload Policy
// ----------------------------------------------------------------------------

/// The name and UUID list that will actually be handed to the native stack
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementPayload {
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    /// The remaining optional fields, passed through unchanged
    pub extra: AdvertisementData,
}

/// Bytes a service UUID list occupies in the advertisement
pub fn uuid_list_cost(uuids: &[Uuid]) -> usize {
    if uuids.is_empty() {
        return 0;
    }
    let short = uuids.iter().filter(|u| short_form(u).is_some()).count();
    let long = uuids.len() - short;
    let mut cost = 0;
    if short > 0 {
        cost += AD_HEADER_LEN + 2 * short;
    }
    if long > 0 {
        cost += AD_HEADER_LEN + 16 * long;
    }
    cost
}

/// Bytes a complete local name occupies in the advertisement
pub fn name_cost(name: &str) -> usize {
    if name.is_empty() {
        0
    } else {
        AD_HEADER_LEN + name.len()
    }
}

/// Fit name and UUIDs into `budget` bytes
///
/// With `name_priority` the full name is kept and the UUID list dropped when
/// both do not fit; otherwise the UUID list is kept and the name omitted. The
/// name is never cut mid-string.
pub fn fit_payload(
    name: Option<&str>,
    uuids: &[Uuid],
    budget: usize,
    name_priority: bool,
) -> (Option<String>, Vec<Uuid>) {
    let name = name.filter(|n| !n.is_empty());
    let name_len = name.map(name_cost).unwrap_or(0);
    let uuid_len = uuid_list_cost(uuids);

    if name_len + uuid_len <= budget {
        return (name.map(str::to_string), uuids.to_vec());
    }

    match name {
        Some(name) if name_priority || uuids.is_empty() => {
            if name_len > budget {
                warn!(name, budget, "Local name exceeds the advertisement budget on its own");
            } else if !uuids.is_empty() {
                warn!(name, "Dropping service UUIDs from the advertisement to fit the local name");
            }
            (Some(name.to_string()), Vec::new())
        }
        Some(name) => {
            warn!(name, "Omitting the local name from the advertisement to fit the service UUIDs");
            if uuid_len > budget {
                warn!(budget, count = uuids.len(), "Service UUID list exceeds the advertisement budget");
            }
            (None, uuids.to_vec())
        }
        None => {
            warn!(budget, count = uuids.len(), "Service UUID list exceeds the advertisement budget");
            (None, uuids.to_vec())
        }
    }
}

impl AdvertisementPayload {
    /// Build the payload for `name` and `services`, applying `budget` if set
    pub fn build(
        name: &str,
        services: &[Uuid],
        data: Option<&AdvertisementData>,
        budget: Option<usize>,
        name_priority: bool,
    ) -> Self {
        let extra = data.cloned().unwrap_or_default();
        let local_name = extra.local_name.clone().or_else(|| Some(name.to_string()));
        let uuids = if extra.service_uuids.is_empty() {
            services.to_vec()
        } else {
            extra.service_uuids.clone()
        };

        let (local_name, service_uuids) = match budget {
            Some(budget) => fit_payload(local_name.as_deref(), &uuids, budget, name_priority),
            None => (local_name.filter(|n| !n.is_empty()), uuids),
        };

        Self {
            local_name,
            service_uuids,
            extra,
        }
    }
}
