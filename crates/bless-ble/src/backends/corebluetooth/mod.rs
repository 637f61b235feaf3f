//! macOS CoreBluetooth backend
//!
//! `CBPeripheralManager` reports everything through delegate callbacks on its
//! dispatch queue. The delegate turns each callback into a [`PeripheralEvent`]
//! and the backend's pump resolves waiters, tracks subscriptions and answers
//! ATT requests. Native calls sit behind [`PeripheralManagerDriver`] so the
//! bridge runs against a fake in tests.

pub mod flags;
#[cfg(all(target_os = "macos", feature = "corebluetooth"))]
pub mod native;

use std::collections::HashMap;
use std::sync::Arc;

use bless_core::{
    AdvertisementField, AdvertisementPayload, AttError, BackendError, BackendKind, BlessError,
    Characteristic, Descriptor, GattBackend, RequestContext, RequestDispatcher, Result, Service,
    SubscriptionSet, LEGACY_PAYLOAD_BUDGET,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::spawn_pump;
#[cfg(all(target_os = "macos", feature = "corebluetooth"))]
use crate::bridge::EventSink;

const BACKEND: &str = "corebluetooth";

/// Only the name and service UUIDs can be set on a CoreBluetooth advertisement
const SUPPORTED_FIELDS: &[AdvertisementField] =
    &[AdvertisementField::LocalName, AdvertisementField::ServiceUuids];

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// `CBManagerState`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl ManagerState {
    pub fn from_raw(state: isize) -> Self {
        match state {
            1 => ManagerState::Resetting,
            2 => ManagerState::Unsupported,
            3 => ManagerState::Unauthorized,
            4 => ManagerState::PoweredOff,
            5 => ManagerState::PoweredOn,
            _ => ManagerState::Unknown,
        }
    }
}

/// Opaque, retained native `CBATTRequest`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken(pub usize);

/// One ATT request as delivered by the delegate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttRequest {
    pub token: RequestToken,
    pub central: String,
    pub characteristic: Uuid,
    pub offset: usize,
    /// Written bytes; `None` for reads
    pub value: Option<Vec<u8>>,
}

/// Delegate callbacks, converted to owned values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
    StateUpdated { state: ManagerState },
    ServiceAdded { service: Uuid, error: Option<String> },
    AdvertisingStarted { error: Option<String> },
    CentralSubscribed { central: String, characteristic: Uuid },
    CentralUnsubscribed { central: String, characteristic: Uuid },
    ReadRequest(AttRequest),
    WriteRequests(Vec<AttRequest>),
    ReadyToUpdateSubscribers,
}

// ----------------------------------------------------------------------------
// Native Driver
// ----------------------------------------------------------------------------

/// A translated `CBMutableService`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CbService {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<CbCharacteristic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CbCharacteristic {
    pub uuid: Uuid,
    pub properties: usize,
    pub permissions: usize,
    pub descriptors: Vec<CbDescriptor>,
}

/// CoreBluetooth descriptors carry a static value and no flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CbDescriptor {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

/// The `CBPeripheralManager` calls the backend makes
///
/// Completion of `add_service` and `start_advertising` arrives later as a
/// [`PeripheralEvent`].
pub trait PeripheralManagerDriver: Send + Sync {
    fn add_service(&self, service: &CbService) -> Result<()>;

    fn remove_all_services(&self);

    fn start_advertising(&self, local_name: Option<&str>, service_uuids: &[Uuid]);

    fn stop_advertising(&self);

    fn is_advertising(&self) -> bool;

    /// Answer a request, releasing its token
    fn respond(&self, token: RequestToken, result: AttError, value: Option<&[u8]>);

    /// Release a token that will not be answered
    fn release(&self, token: RequestToken);

    /// `updateValue:forCharacteristic:onSubscribedCentrals:`; false when the
    /// transmit queue is full
    fn update_value(&self, characteristic: &Uuid, value: &[u8]) -> bool;
}

// ----------------------------------------------------------------------------
// Pump State
// ----------------------------------------------------------------------------

type Completion = oneshot::Sender<Option<String>>;

#[derive(Default)]
struct Waiters {
    services: HashMap<Uuid, Completion>,
    advertising: Option<Completion>,
}

struct Shared {
    powered: watch::Sender<bool>,
    waiters: Mutex<Waiters>,
    subscriptions: Mutex<SubscriptionSet>,
}

fn handle_event(
    dispatcher: &RequestDispatcher,
    driver: &dyn PeripheralManagerDriver,
    shared: &Shared,
    event: PeripheralEvent,
) {
    match event {
        PeripheralEvent::StateUpdated { state } => {
            info!(?state, "Peripheral manager state updated");
            shared.powered.send_replace(state == ManagerState::PoweredOn);
        }
        PeripheralEvent::ServiceAdded { service, error } => {
            match &error {
                Some(reason) => error!(%service, "Failed to add service: {}", reason),
                None => debug!(%service, "Service added"),
            }
            match shared.waiters.lock().services.remove(&service) {
                Some(waiter) => {
                    let _ = waiter.send(error);
                }
                None => warn!(%service, "Service added callback with no pending registration"),
            }
        }
        PeripheralEvent::AdvertisingStarted { error } => {
            match &error {
                Some(reason) => error!("Failed to start advertising: {}", reason),
                None => info!("Advertising started"),
            }
            if let Some(waiter) = shared.waiters.lock().advertising.take() {
                let _ = waiter.send(error);
            }
        }
        PeripheralEvent::CentralSubscribed { central, characteristic } => {
            shared.subscriptions.lock().subscribe(&central, characteristic);
        }
        PeripheralEvent::CentralUnsubscribed { central, characteristic } => {
            shared.subscriptions.lock().unsubscribe(&central, characteristic);
        }
        PeripheralEvent::ReadRequest(request) => {
            let ctx = RequestContext::new()
                .with_central(request.central.clone())
                .with_offset(request.offset);
            match dispatcher.answer_read(request.characteristic, &ctx) {
                Ok(value) => driver.respond(request.token, AttError::Success, Some(&value)),
                Err(code) => driver.respond(request.token, code, None),
            }
        }
        PeripheralEvent::WriteRequests(requests) => {
            // CoreBluetooth expects one response, to the first request of the batch
            let mut result = AttError::Success;
            for request in &requests {
                if result != AttError::Success {
                    break;
                }
                let ctx = RequestContext::new()
                    .with_central(request.central.clone())
                    .with_offset(request.offset)
                    .with_response(true);
                let value = request.value.clone().unwrap_or_default();
                if let Err(code) = dispatcher.answer_write(request.characteristic, value, &ctx) {
                    result = code;
                }
            }
            let mut tokens = requests.iter().map(|r| r.token);
            if let Some(first) = tokens.next() {
                driver.respond(first, result, None);
            }
            for token in tokens {
                driver.release(token);
            }
        }
        PeripheralEvent::ReadyToUpdateSubscribers => {
            debug!("Peripheral manager ready to update subscribers");
        }
    }
}

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

pub struct CoreBluetoothBackend {
    driver: Arc<dyn PeripheralManagerDriver>,
    shared: Arc<Shared>,
    powered: watch::Receiver<bool>,
    services: Vec<CbService>,
    pump: JoinHandle<()>,
}

impl CoreBluetoothBackend {
    /// Create a `CBPeripheralManager` with a bridging delegate
    #[cfg(all(target_os = "macos", feature = "corebluetooth"))]
    pub fn new(dispatcher: RequestDispatcher) -> Result<Self> {
        let (sink, events) = EventSink::channel(BACKEND);
        let driver = native::CbPeripheralManager::new(sink)?;
        Self::with_driver(dispatcher, Arc::new(driver), events)
    }

    /// Wire an existing driver and its event queue to `dispatcher`
    pub fn with_driver(
        dispatcher: RequestDispatcher,
        driver: Arc<dyn PeripheralManagerDriver>,
        events: mpsc::UnboundedReceiver<PeripheralEvent>,
    ) -> Result<Self> {
        let (powered_tx, powered) = watch::channel(false);
        let shared = Arc::new(Shared {
            powered: powered_tx,
            waiters: Mutex::new(Waiters::default()),
            subscriptions: Mutex::new(SubscriptionSet::new()),
        });

        let pump_driver = Arc::clone(&driver);
        let pump_shared = Arc::clone(&shared);
        let pump = spawn_pump(BACKEND, events, move |event| {
            handle_event(&dispatcher, pump_driver.as_ref(), &pump_shared, event)
        })?;

        Ok(Self {
            driver,
            shared,
            powered,
            services: Vec::new(),
            pump,
        })
    }

    fn service_mut(&mut self, uuid: &Uuid) -> Result<&mut CbService> {
        self.services
            .iter_mut()
            .find(|s| &s.uuid == uuid)
            .ok_or_else(|| BlessError::ServiceNotFound {
                uuid: uuid.to_string(),
            })
    }

    fn pump_closed() -> BlessError {
        BackendError::PumpClosed {
            backend: BACKEND.to_string(),
        }
        .into()
    }
}

impl Drop for CoreBluetoothBackend {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait::async_trait]
impl GattBackend for CoreBluetoothBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::CoreBluetooth
    }

    fn payload_budget(&self) -> Option<usize> {
        Some(LEGACY_PAYLOAD_BUDGET)
    }

    fn supported_advertisement_fields(&self) -> &'static [AdvertisementField] {
        SUPPORTED_FIELDS
    }

    async fn wait_for_powered_on(&mut self) -> Result<()> {
        self.powered
            .wait_for(|powered| *powered)
            .await
            .map_err(|_| Self::pump_closed())?;
        Ok(())
    }

    async fn add_new_service(&mut self, service: &Service) -> Result<()> {
        self.services.push(CbService {
            uuid: service.uuid(),
            primary: service.primary(),
            characteristics: Vec::new(),
        });
        Ok(())
    }

    async fn add_new_characteristic(
        &mut self,
        service: &Service,
        characteristic: &Characteristic,
    ) -> Result<()> {
        let native = CbCharacteristic {
            uuid: characteristic.uuid(),
            properties: flags::translate_properties(characteristic.properties()),
            permissions: flags::translate_permissions(characteristic.permissions()),
            descriptors: Vec::new(),
        };
        self.service_mut(&service.uuid())?.characteristics.push(native);
        Ok(())
    }

    async fn add_new_descriptor(
        &mut self,
        characteristic: &Characteristic,
        descriptor: &Descriptor,
    ) -> Result<()> {
        let char_uuid = characteristic.uuid();
        let native = self
            .service_mut(&characteristic.service_uuid())?
            .characteristics
            .iter_mut()
            .find(|c| c.uuid == char_uuid)
            .ok_or_else(|| BlessError::CharacteristicNotFound {
                uuid: char_uuid.to_string(),
            })?;
        native.descriptors.push(CbDescriptor {
            uuid: descriptor.uuid(),
            value: descriptor.value(),
        });
        Ok(())
    }

    async fn register_services(&mut self, services: &[Service]) -> Result<()> {
        for service in services {
            let uuid = service.uuid();
            let native = self
                .services
                .iter()
                .find(|s| s.uuid == uuid)
                .cloned()
                .ok_or_else(|| BlessError::ServiceNotFound {
                    uuid: uuid.to_string(),
                })?;

            let (tx, rx) = oneshot::channel();
            self.shared.waiters.lock().services.insert(uuid, tx);
            self.driver.add_service(&native)?;

            match rx.await {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    return Err(BackendError::AddServiceFailed {
                        uuid: uuid.to_string(),
                        reason,
                    }
                    .into())
                }
                Err(_) => return Err(Self::pump_closed()),
            }
        }
        Ok(())
    }

    async fn start_advertising(&mut self, payload: &AdvertisementPayload) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.shared.waiters.lock().advertising = Some(tx);
        self.driver
            .start_advertising(payload.local_name.as_deref(), &payload.service_uuids);

        match rx.await {
            Ok(None) => Ok(()),
            Ok(Some(reason)) => Err(BackendError::AdvertisingFailed { reason }.into()),
            Err(_) => Err(Self::pump_closed()),
        }
    }

    async fn stop_advertising(&mut self) -> Result<()> {
        self.driver.stop_advertising();
        Ok(())
    }

    async fn unregister(&mut self) -> Result<()> {
        self.driver.stop_advertising();
        self.driver.remove_all_services();
        let mut waiters = self.shared.waiters.lock();
        waiters.services.clear();
        waiters.advertising = None;
        Ok(())
    }

    async fn is_advertising(&self) -> Result<bool> {
        Ok(self.driver.is_advertising())
    }

    async fn is_connected(&self) -> Result<bool> {
        Ok(self.shared.subscriptions.lock().is_connected())
    }

    async fn update_value(&mut self, characteristic: &Characteristic) -> Result<bool> {
        let mut value = characteristic.value();
        if value.is_empty() {
            // An empty update is not delivered; send a single zero byte instead
            value = vec![0];
        }
        let sent = self.driver.update_value(&characteristic.uuid(), &value);
        if !sent {
            debug!(uuid = %characteristic.uuid(), "Transmit queue full; update not sent");
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bless_core::{
        BlessServer, CallbackRegistry, GattAttributePermissions, GattCharacteristicProperties,
        GattTree, ServerConfig,
    };

    use crate::bridge::EventSink;

    const SERVICE: &str = "a07498ca-ad5b-474e-940d-16f1fbe7e8cd";
    const CHARACTERISTIC: &str = "51ff12bb-3ed8-46e5-b4f9-d64e2fec021b";

    #[derive(Default)]
    struct FakeManager {
        added: Mutex<Vec<CbService>>,
        responses: Mutex<Vec<(RequestToken, AttError, Option<Vec<u8>>)>>,
        released: Mutex<Vec<RequestToken>>,
        updates: Mutex<Vec<(Uuid, Vec<u8>)>>,
        advertised: Mutex<Vec<(Option<String>, Vec<Uuid>)>>,
        /// When set, completions are confirmed right away like a live manager
        events: Mutex<Option<EventSink<PeripheralEvent>>>,
    }

    impl PeripheralManagerDriver for FakeManager {
        fn add_service(&self, service: &CbService) -> Result<()> {
            self.added.lock().push(service.clone());
            if let Some(events) = self.events.lock().as_ref() {
                events.push(PeripheralEvent::ServiceAdded {
                    service: service.uuid,
                    error: None,
                });
            }
            Ok(())
        }

        fn remove_all_services(&self) {
            self.added.lock().clear();
        }

        fn start_advertising(&self, local_name: Option<&str>, service_uuids: &[Uuid]) {
            self.advertised
                .lock()
                .push((local_name.map(str::to_string), service_uuids.to_vec()));
            if let Some(events) = self.events.lock().as_ref() {
                events.push(PeripheralEvent::AdvertisingStarted { error: None });
            }
        }

        fn stop_advertising(&self) {}

        fn is_advertising(&self) -> bool {
            false
        }

        fn respond(&self, token: RequestToken, result: AttError, value: Option<&[u8]>) {
            self.responses.lock().push((token, result, value.map(<[u8]>::to_vec)));
        }

        fn release(&self, token: RequestToken) {
            self.released.lock().push(token);
        }

        fn update_value(&self, characteristic: &Uuid, value: &[u8]) -> bool {
            self.updates.lock().push((*characteristic, value.to_vec()));
            true
        }
    }

    struct Harness {
        backend: CoreBluetoothBackend,
        sink: EventSink<PeripheralEvent>,
        driver: Arc<FakeManager>,
        dispatcher: RequestDispatcher,
    }

    async fn harness() -> Harness {
        let tree = GattTree::new();
        let service = tree.add_service(SERVICE).unwrap();
        let characteristic = tree
            .add_characteristic(
                SERVICE,
                CHARACTERISTIC,
                GattCharacteristicProperties::READ
                    | GattCharacteristicProperties::WRITE
                    | GattCharacteristicProperties::INDICATE,
                GattAttributePermissions::READABLE | GattAttributePermissions::WRITEABLE,
                Some(b"abc".to_vec()),
            )
            .unwrap();
        let dispatcher = RequestDispatcher::new(tree, CallbackRegistry::new());
        dispatcher.callbacks().set_read(|attr, _| attr.value());
        dispatcher
            .callbacks()
            .set_write(|attr, value, _| attr.set_value(value));

        let (sink, events) = EventSink::channel(BACKEND);
        let driver = Arc::new(FakeManager::default());
        let as_driver: Arc<dyn PeripheralManagerDriver> = driver.clone();
        let mut backend =
            CoreBluetoothBackend::with_driver(dispatcher.clone(), as_driver, events).unwrap();
        backend.add_new_service(&service).await.unwrap();
        backend
            .add_new_characteristic(&service, &characteristic)
            .await
            .unwrap();

        Harness {
            backend,
            sink,
            driver,
            dispatcher,
        }
    }

    fn uuid(text: &str) -> Uuid {
        Uuid::parse_str(text).unwrap()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_power_state_gates_start() {
        let mut h = harness().await;
        h.sink.push(PeripheralEvent::StateUpdated {
            state: ManagerState::PoweredOff,
        });
        settle().await;
        assert!(!*h.backend.powered.borrow());

        h.sink.push(PeripheralEvent::StateUpdated {
            state: ManagerState::PoweredOn,
        });
        h.backend.wait_for_powered_on().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_waits_for_service_added() {
        let mut h = harness().await;
        let services = h.dispatcher.tree().services();
        let sink = h.sink.clone();
        tokio::spawn(async move {
            settle().await;
            sink.push(PeripheralEvent::ServiceAdded {
                service: uuid(SERVICE),
                error: None,
            });
        });
        h.backend.register_services(&services).await.unwrap();

        let added = h.driver.added.lock().clone();
        assert_eq!(added.len(), 1);
        assert!(added[0].primary);
        assert_eq!(
            added[0].characteristics[0].properties,
            flags::cb_properties::READ | flags::cb_properties::WRITE | flags::cb_properties::INDICATE
        );
    }

    #[tokio::test]
    async fn test_service_error_fails_registration() {
        let mut h = harness().await;
        let services = h.dispatcher.tree().services();
        let sink = h.sink.clone();
        tokio::spawn(async move {
            settle().await;
            sink.push(PeripheralEvent::ServiceAdded {
                service: uuid(SERVICE),
                error: Some("bad service".to_string()),
            });
        });
        let err = h.backend.register_services(&services).await.unwrap_err();
        assert!(matches!(
            err,
            BlessError::Backend(BackendError::AddServiceFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_request_is_answered_at_offset() {
        let h = harness().await;
        h.sink.push(PeripheralEvent::ReadRequest(AttRequest {
            token: RequestToken(7),
            central: "central-1".to_string(),
            characteristic: uuid(CHARACTERISTIC),
            offset: 1,
            value: None,
        }));
        settle().await;
        assert_eq!(
            h.driver.responses.lock().clone(),
            vec![(RequestToken(7), AttError::Success, Some(b"bc".to_vec()))]
        );
    }

    #[tokio::test]
    async fn test_write_batch_gets_one_response() {
        let h = harness().await;
        let request = |token, value: &[u8]| AttRequest {
            token: RequestToken(token),
            central: "central-1".to_string(),
            characteristic: uuid(CHARACTERISTIC),
            offset: 0,
            value: Some(value.to_vec()),
        };
        h.sink
            .push(PeripheralEvent::WriteRequests(vec![request(1, b"\x0f"), request(2, b"\x10")]));
        settle().await;

        assert_eq!(
            h.driver.responses.lock().clone(),
            vec![(RequestToken(1), AttError::Success, None)]
        );
        assert_eq!(h.driver.released.lock().clone(), vec![RequestToken(2)]);
        let characteristic = h.dispatcher.tree().get_characteristic(CHARACTERISTIC).unwrap();
        assert_eq!(characteristic.value(), vec![0x10]);
    }

    #[tokio::test]
    async fn test_unknown_characteristic_read_faults() {
        let h = harness().await;
        h.sink.push(PeripheralEvent::ReadRequest(AttRequest {
            token: RequestToken(3),
            central: "central-1".to_string(),
            characteristic: Uuid::from_u128(1),
            offset: 0,
            value: None,
        }));
        settle().await;
        assert_eq!(
            h.driver.responses.lock().clone(),
            vec![(RequestToken(3), AttError::AttributeNotFound, None)]
        );
        assert!(h.dispatcher.faults().is_set());
    }

    #[tokio::test]
    async fn test_subscriptions_and_empty_update() {
        let mut h = harness().await;
        h.sink.push(PeripheralEvent::CentralSubscribed {
            central: "central-1".to_string(),
            characteristic: uuid(CHARACTERISTIC),
        });
        settle().await;
        assert!(h.backend.is_connected().await.unwrap());

        let characteristic = h.dispatcher.tree().get_characteristic(CHARACTERISTIC).unwrap();
        characteristic.set_value(Vec::new());
        assert!(h.backend.update_value(&characteristic).await.unwrap());
        assert_eq!(h.driver.updates.lock()[0].1, vec![0]);

        h.sink.push(PeripheralEvent::CentralUnsubscribed {
            central: "central-1".to_string(),
            characteristic: uuid(CHARACTERISTIC),
        });
        settle().await;
        assert!(!h.backend.is_connected().await.unwrap());
    }

    #[tokio::test]
    async fn test_default_config_keeps_full_name_within_budget() {
        let dispatcher = RequestDispatcher::new(GattTree::new(), CallbackRegistry::new());
        let (sink, events) = EventSink::channel(BACKEND);
        let driver = Arc::new(FakeManager {
            events: Mutex::new(Some(sink.clone())),
            ..FakeManager::default()
        });
        let as_driver: Arc<dyn PeripheralManagerDriver> = driver.clone();
        let backend =
            CoreBluetoothBackend::with_driver(dispatcher.clone(), as_driver, events).unwrap();
        let server =
            BlessServer::from_parts(ServerConfig::new("Test Service"), dispatcher, backend).unwrap();

        server.add_new_service(SERVICE).await.unwrap();
        server
            .add_new_characteristic(
                SERVICE,
                CHARACTERISTIC,
                GattCharacteristicProperties::READ
                    | GattCharacteristicProperties::WRITE
                    | GattCharacteristicProperties::INDICATE,
                None,
                GattAttributePermissions::READABLE | GattAttributePermissions::WRITEABLE,
            )
            .await
            .unwrap();
        sink.push(PeripheralEvent::StateUpdated {
            state: ManagerState::PoweredOn,
        });
        server.start().await.unwrap();

        // 14 bytes of name and 18 of UUID list exceed the 28 byte budget
        assert_eq!(
            driver.advertised.lock().clone(),
            vec![(Some("Test Service".to_string()), Vec::new())]
        );
    }
}
