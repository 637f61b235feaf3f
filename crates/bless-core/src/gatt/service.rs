//! GATT service handle

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use super::characteristic::Characteristic;
use super::uuids::IntoGattUuid;

/// A primary or secondary service
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    uuid: Uuid,
    primary: bool,
    characteristics: RwLock<Vec<Characteristic>>,
}

impl Service {
    pub(crate) fn new(uuid: Uuid, primary: bool) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                uuid,
                primary,
                characteristics: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// Only the first service added to a server is primary
    pub fn primary(&self) -> bool {
        self.inner.primary
    }

    pub fn characteristics(&self) -> Vec<Characteristic> {
        self.inner.characteristics.read().clone()
    }

    pub fn get_characteristic(&self, uuid: impl IntoGattUuid) -> Option<Characteristic> {
        let uuid = uuid.into_gatt_uuid().ok()?;
        self.find_characteristic(&uuid)
    }

    pub fn ptr_eq(&self, other: &Service) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn find_characteristic(&self, uuid: &Uuid) -> Option<Characteristic> {
        self.inner
            .characteristics
            .read()
            .iter()
            .find(|c| &c.uuid() == uuid)
            .cloned()
    }

    pub(crate) fn push_characteristic(&self, characteristic: Characteristic) {
        self.inner.characteristics.write().push(characteristic);
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("uuid", &self.inner.uuid)
            .field("primary", &self.inner.primary)
            .field("characteristics", &*self.inner.characteristics.read())
            .finish()
    }
}
