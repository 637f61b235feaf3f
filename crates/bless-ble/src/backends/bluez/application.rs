//! In-memory model of the exported BlueZ GATT application
//!
//! Mirrors the D-Bus object tree: one `GattService1` per service under
//! `/org/bluez/<name>`, characteristics and descriptors nested below. Object
//! paths are derived from insertion order, so registration must be sequential.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bless_core::{
    AdvertisementPayload, BlessError, Characteristic, Descriptor, Result, Service,
};
use uuid::Uuid;

use super::flags::{characteristic_flags, descriptor_flags, FlagList};

/// Minimum and maximum advertising interval
pub const ADVERTISING_INTERVAL: Duration = Duration::from_millis(100);

/// `org.bluez.GattDescriptor1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorNode {
    pub path: String,
    pub uuid: Uuid,
    pub flags: FlagList,
}

/// `org.bluez.GattCharacteristic1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicNode {
    pub path: String,
    pub uuid: Uuid,
    pub flags: FlagList,
    pub descriptors: Vec<DescriptorNode>,
}

/// `org.bluez.GattService1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNode {
    pub path: String,
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicNode>,
}

/// `org.bluez.GattApplication1` root and its object tree
#[derive(Debug, Clone, Default)]
pub struct GattApplication {
    base_path: String,
    services: Vec<ServiceNode>,
    paths: HashMap<String, Uuid>,
    advertisements: usize,
}

/// Keep only characters valid in a D-Bus object path element
fn path_element(name: &str) -> String {
    let element: String = name
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if element.is_empty() {
        "bless".to_string()
    } else {
        element
    }
}

impl GattApplication {
    pub fn new(name: &str) -> Self {
        Self {
            base_path: format!("/org/bluez/{}", path_element(name)),
            ..Self::default()
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn services(&self) -> &[ServiceNode] {
        &self.services
    }

    pub fn add_service(&mut self, service: &Service) -> &ServiceNode {
        let path = format!("{}/service{:04x}", self.base_path, self.services.len() + 1);
        self.paths.insert(path.clone(), service.uuid());
        self.services.push(ServiceNode {
            path,
            uuid: service.uuid(),
            primary: self.services.is_empty(),
            characteristics: Vec::new(),
        });
        &self.services[self.services.len() - 1]
    }

    pub fn add_characteristic(
        &mut self,
        service: &Service,
        characteristic: &Characteristic,
    ) -> Result<&CharacteristicNode> {
        let node = self
            .services
            .iter_mut()
            .find(|s| s.uuid == service.uuid())
            .ok_or_else(|| BlessError::ServiceNotFound {
                uuid: service.uuid().to_string(),
            })?;
        let path = format!("{}/char{:04x}", node.path, node.characteristics.len() + 1);
        self.paths.insert(path.clone(), characteristic.uuid());
        node.characteristics.push(CharacteristicNode {
            path,
            uuid: characteristic.uuid(),
            flags: characteristic_flags(characteristic.properties(), characteristic.permissions()),
            descriptors: Vec::new(),
        });
        Ok(&node.characteristics[node.characteristics.len() - 1])
    }

    pub fn add_descriptor(
        &mut self,
        characteristic: &Characteristic,
        descriptor: &Descriptor,
    ) -> Result<&DescriptorNode> {
        let char_uuid = characteristic.uuid();
        let node = self
            .services
            .iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
            .find(|c| c.uuid == char_uuid)
            .ok_or_else(|| BlessError::CharacteristicNotFound {
                uuid: char_uuid.to_string(),
            })?;
        let path = format!("{}/desc{:04x}", node.path, node.descriptors.len() + 1);
        self.paths.insert(path.clone(), descriptor.uuid());
        node.descriptors.push(DescriptorNode {
            path,
            uuid: descriptor.uuid(),
            flags: descriptor_flags(descriptor.properties(), descriptor.permissions()),
        });
        Ok(&node.descriptors[node.descriptors.len() - 1])
    }

    /// UUID of the attribute exported at `path`
    pub fn uuid_at(&self, path: &str) -> Option<Uuid> {
        self.paths.get(path).copied()
    }

    /// Object path of the characteristic or descriptor `uuid`
    pub fn path_of(&self, uuid: &Uuid) -> Option<&str> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find_map(|c| {
                if &c.uuid == uuid {
                    Some(c.path.as_str())
                } else {
                    c.descriptors
                        .iter()
                        .find(|d| &d.uuid == uuid)
                        .map(|d| d.path.as_str())
                }
            })
    }

    /// Build the next `LEAdvertisement1` object
    pub fn next_advertisement(&mut self, payload: &AdvertisementPayload) -> LeAdvertisement {
        self.advertisements += 1;
        LeAdvertisement::from_payload(
            format!("{}/advertisement{}", self.base_path, self.advertisements),
            payload,
        )
    }
}

// ----------------------------------------------------------------------------
// Advertisement
// ----------------------------------------------------------------------------

/// `org.bluez.LEAdvertisement1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeAdvertisement {
    pub path: String,
    pub service_uuids: Vec<Uuid>,
    pub local_name: Option<String>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    pub discoverable: Option<bool>,
    pub tx_power: Option<i16>,
    pub min_interval: Duration,
    pub max_interval: Duration,
}

impl LeAdvertisement {
    pub fn from_payload(path: String, payload: &AdvertisementPayload) -> Self {
        Self {
            path,
            service_uuids: payload.service_uuids.clone(),
            local_name: payload.local_name.clone(),
            manufacturer_data: payload.extra.manufacturer_data.clone(),
            service_data: payload.extra.service_data.clone(),
            discoverable: payload.extra.is_discoverable,
            tx_power: payload.extra.tx_power,
            min_interval: ADVERTISING_INTERVAL,
            max_interval: ADVERTISING_INTERVAL,
        }
    }

    /// `IncludeTxPower`
    pub fn include_tx_power(&self) -> bool {
        self.tx_power.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bless_core::{
        AdvertisementData, GattAttributePermissions, GattCharacteristicProperties,
        GattDescriptorProperties, GattTree,
    };

    const SERVICE: &str = "a07498ca-ad5b-474e-940d-16f1fbe7e8cd";
    const CHARACTERISTIC: &str = "51ff12bb-3ed8-46e5-b4f9-d64e2fec021b";
    const DESCRIPTOR: u16 = 0x2901;

    fn application() -> (GattTree, GattApplication) {
        let tree = GattTree::new();
        let mut app = GattApplication::new("Test Service");
        let service = tree.add_service(SERVICE).unwrap();
        app.add_service(&service);
        let characteristic = tree
            .add_characteristic(
                SERVICE,
                CHARACTERISTIC,
                GattCharacteristicProperties::READ | GattCharacteristicProperties::NOTIFY,
                GattAttributePermissions::READABLE,
                None,
            )
            .unwrap();
        app.add_characteristic(&service, &characteristic).unwrap();
        let descriptor = tree
            .add_descriptor(
                SERVICE,
                CHARACTERISTIC,
                DESCRIPTOR,
                GattDescriptorProperties::READ,
                GattAttributePermissions::READABLE,
                Some(b"temp".to_vec()),
            )
            .unwrap();
        app.add_descriptor(&characteristic, &descriptor).unwrap();
        (tree, app)
    }

    #[test]
    fn test_object_paths() {
        let (_tree, app) = application();
        assert_eq!(app.base_path(), "/org/bluez/TestService");

        let service = &app.services()[0];
        assert_eq!(service.path, "/org/bluez/TestService/service0001");
        assert!(service.primary);

        let characteristic = &service.characteristics[0];
        assert_eq!(characteristic.path, "/org/bluez/TestService/service0001/char0001");
        assert_eq!(characteristic.flags.as_slice(), &["read", "notify"]);
        assert_eq!(
            characteristic.descriptors[0].path,
            "/org/bluez/TestService/service0001/char0001/desc0001"
        );
    }

    #[test]
    fn test_path_lookup_both_ways() {
        let (tree, app) = application();
        let characteristic = tree.get_characteristic(CHARACTERISTIC).unwrap();
        let path = app.path_of(&characteristic.uuid()).unwrap();
        assert_eq!(app.uuid_at(path), Some(characteristic.uuid()));

        let descriptor = tree.get_descriptor(DESCRIPTOR).unwrap();
        assert!(app.path_of(&descriptor.uuid()).unwrap().ends_with("/desc0001"));
        assert_eq!(app.uuid_at("/org/bluez/TestService/service0002"), None);
    }

    #[test]
    fn test_second_service_is_secondary_with_next_index() {
        let tree = GattTree::new();
        let mut app = GattApplication::new("x");
        let first = tree.add_service(SERVICE).unwrap();
        let second = tree.add_service(0x180fu16).unwrap();
        app.add_service(&first);
        let node = app.add_service(&second);
        assert_eq!(node.path, "/org/bluez/x/service0002");
        assert!(!node.primary);
    }

    #[test]
    fn test_advertisement_paths_count_up() {
        let (_tree, mut app) = application();
        let data = AdvertisementData::new().with_manufacturer_data(0xffff, vec![1, 2]).with_tx_power(4);
        let payload = AdvertisementPayload::build("Test Service", &[], Some(&data), None, false);

        let first = app.next_advertisement(&payload);
        let second = app.next_advertisement(&payload);
        assert_eq!(first.path, "/org/bluez/TestService/advertisement1");
        assert_eq!(second.path, "/org/bluez/TestService/advertisement2");
        assert_eq!(first.local_name.as_deref(), Some("Test Service"));
        assert_eq!(first.manufacturer_data.get(&0xffff), Some(&vec![1, 2]));
        assert!(first.include_tx_power());
        assert_eq!(first.min_interval, ADVERTISING_INTERVAL);
    }
}
