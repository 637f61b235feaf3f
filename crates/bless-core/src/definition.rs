//! Declarative GATT tree
//!
//! A whole service hierarchy described as data, loaded from TOML or JSON and
//! registered in one call with [`BlessServer::add_gatt`](crate::BlessServer::add_gatt).
//! Lists keep declaration order, so the first service listed is primary.
//!
//! ```toml
//! [[services]]
//! uuid = "A07498CA-AD5B-474E-940D-16F1FBE7E8CD"
//!
//! [[services.characteristics]]
//! uuid = "51FF12BB-3ED8-46E5-B4F9-D64E2FEC021B"
//! properties = "READ | WRITE | INDICATE"
//! permissions = "READABLE | WRITEABLE"
//! value = "0f"
//! ```

use serde::{Deserialize, Serialize};

use crate::errors::{BlessError, Result};
use crate::flags::{GattAttributePermissions, GattCharacteristicProperties, GattDescriptorProperties};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GattDefinition {
    pub services: Vec<ServiceDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub uuid: String,
    #[serde(default)]
    pub characteristics: Vec<CharacteristicDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDefinition {
    pub uuid: String,
    #[serde(default)]
    pub properties: GattCharacteristicProperties,
    /// Derived from `properties` when omitted
    #[serde(default)]
    pub permissions: Option<GattAttributePermissions>,
    /// Initial value as a hex string
    #[serde(default, with = "hex_value")]
    pub value: Option<Vec<u8>>,
    #[serde(default)]
    pub descriptors: Vec<DescriptorDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorDefinition {
    pub uuid: String,
    #[serde(default)]
    pub properties: GattDescriptorProperties,
    #[serde(default)]
    pub permissions: Option<GattAttributePermissions>,
    #[serde(default, with = "hex_value")]
    pub value: Option<Vec<u8>>,
}

impl CharacteristicDefinition {
    pub fn effective_permissions(&self) -> GattAttributePermissions {
        self.permissions
            .unwrap_or_else(|| GattAttributePermissions::implied_by(self.properties))
    }
}

impl DescriptorDefinition {
    pub fn effective_permissions(&self) -> GattAttributePermissions {
        self.permissions.unwrap_or_else(|| {
            let mut permissions = GattAttributePermissions::empty();
            if self.properties.contains(GattDescriptorProperties::READ) {
                permissions |= GattAttributePermissions::READABLE;
            }
            if self.properties.contains(GattDescriptorProperties::WRITE) {
                permissions |= GattAttributePermissions::WRITEABLE;
            }
            permissions
        })
    }
}

impl GattDefinition {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|e| BlessError::InvalidConfig {
            reason: format!("GATT definition: {}", e),
        })
    }

    pub fn from_json_str(input: &str) -> Result<Self> {
        serde_json::from_str(input).map_err(|e| BlessError::InvalidConfig {
            reason: format!("GATT definition: {}", e),
        })
    }

    /// Total number of attributes (services, characteristics, descriptors)
    pub fn attribute_count(&self) -> usize {
        self.services
            .iter()
            .map(|s| {
                1 + s
                    .characteristics
                    .iter()
                    .map(|c| 1 + c.descriptors.len())
                    .sum::<usize>()
            })
            .sum()
    }
}

mod hex_value {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        text.map(|t| hex::decode(t.trim()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TREE_TOML: &str = r#"
        [[services]]
        uuid = "A07498CA-AD5B-474E-940D-16F1FBE7E8CD"

        [[services.characteristics]]
        uuid = "51FF12BB-3ED8-46E5-B4F9-D64E2FEC021B"
        properties = "READ | WRITE | INDICATE"
        permissions = "READABLE | WRITEABLE"

        [[services.characteristics]]
        uuid = "bfc0c92f-317d-4ba9-976b-cc11ce77b4ca"
        properties = "READ"
        value = "0f"

        [[services.characteristics.descriptors]]
        uuid = "2901"
        properties = "READ"
        value = "6869"
    "#;

    #[test]
    fn test_toml_definition() {
        let definition = GattDefinition::from_toml_str(TREE_TOML).unwrap();
        assert_eq!(definition.services.len(), 1);
        assert_eq!(definition.attribute_count(), 4);

        let first = &definition.services[0].characteristics[0];
        assert!(first.properties.contains(GattCharacteristicProperties::INDICATE));
        assert_eq!(first.value, None);

        let second = &definition.services[0].characteristics[1];
        assert_eq!(second.value, Some(vec![0x0f]));
        assert_eq!(second.effective_permissions(), GattAttributePermissions::READABLE);
        assert_eq!(second.descriptors[0].value, Some(b"hi".to_vec()));
    }

    #[test]
    fn test_json_definition() {
        let definition = GattDefinition::from_json_str(
            r#"{"services": [{"uuid": "180d", "characteristics": [
                {"uuid": "2a37", "properties": "NOTIFY", "value": "00"}
            ]}]}"#,
        )
        .unwrap();
        assert_eq!(definition.services[0].characteristics[0].value, Some(vec![0]));
    }

    #[test]
    fn test_bad_hex_is_config_error() {
        let err = GattDefinition::from_json_str(
            r#"{"services": [{"uuid": "180d", "characteristics": [{"uuid": "2a37", "value": "zz"}]}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, BlessError::InvalidConfig { .. }));
    }
}
