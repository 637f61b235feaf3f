//! Windows WinRT backend
//!
//! One `GattServiceProvider` per service. Characteristic request events fire
//! on the WinRT thread pool; each handler takes a deferral, wraps the request
//! in a responder and pushes it to the pump, which answers it through the
//! dispatcher. The deferral completes when the responder is dropped.

pub mod deferral;
pub mod flags;
#[cfg(all(target_os = "windows", feature = "winrt"))]
pub mod native;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bless_core::{
    AdvertisementField, AdvertisementPayload, AttError, BackendError, BackendKind, Characteristic,
    Descriptor, GattBackend, RequestContext, RequestDispatcher, Result, Service, SubscriptionSet,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::flags::ProtectionLevel;
use crate::bridge::{spawn_pump, EventSink};

const BACKEND: &str = "winrt";

/// Interval for status polling in [`StatusMode::Poll`]
const STATUS_POLL: Duration = Duration::from_millis(100);

/// `GattServiceProviderAdvertisingParameters` carries only these
const SUPPORTED_FIELDS: &[AdvertisementField] =
    &[AdvertisementField::Connectable, AdvertisementField::Discoverable];

/// Client Characteristic Configuration, owned by the Windows stack
const CCCD: u32 = 0x2902;

// ----------------------------------------------------------------------------
// Native Parameters
// ----------------------------------------------------------------------------

/// `GattServiceProviderAdvertisementStatus`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisementStatus {
    Created,
    Stopped,
    Started,
    Aborted,
    StartedWithoutAllAdvertisementData,
}

impl AdvertisementStatus {
    pub fn from_raw(status: i32) -> Self {
        match status {
            1 => AdvertisementStatus::Stopped,
            2 => AdvertisementStatus::Started,
            3 => AdvertisementStatus::Aborted,
            4 => AdvertisementStatus::StartedWithoutAllAdvertisementData,
            _ => AdvertisementStatus::Created,
        }
    }

    pub fn is_started(self) -> bool {
        matches!(
            self,
            AdvertisementStatus::Started | AdvertisementStatus::StartedWithoutAllAdvertisementData
        )
    }
}

/// `GattLocalCharacteristicParameters`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCharacteristicParameters {
    pub uuid: Uuid,
    pub properties: u32,
    pub read_protection: ProtectionLevel,
    pub write_protection: ProtectionLevel,
}

/// `GattLocalDescriptorParameters`; descriptors are published with a static value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDescriptorParameters {
    pub uuid: Uuid,
    pub read_protection: ProtectionLevel,
    pub write_protection: ProtectionLevel,
    pub value: Vec<u8>,
}

/// `GattServiceProviderAdvertisingParameters`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisingParameters {
    pub connectable: bool,
    pub discoverable: bool,
}

impl AdvertisingParameters {
    fn from_payload(payload: &AdvertisementPayload) -> Self {
        Self {
            connectable: payload.extra.is_connectable.unwrap_or(true),
            discoverable: payload.extra.is_discoverable.unwrap_or(true),
        }
    }
}

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Answers a `GattReadRequest`; dropping it unanswered completes its deferral
pub trait ReadResponder: Send {
    fn respond_with_value(self: Box<Self>, value: &[u8]);

    fn respond_with_error(self: Box<Self>, code: AttError);
}

/// Answers a `GattWriteRequest`
pub trait WriteResponder: Send {
    fn respond(self: Box<Self>);

    fn respond_with_error(self: Box<Self>, code: AttError);
}

pub enum WinRtEvent {
    ReadRequested {
        characteristic: Uuid,
        central: Option<String>,
        offset: usize,
        responder: Box<dyn ReadResponder>,
    },
    WriteRequested {
        characteristic: Uuid,
        central: Option<String>,
        offset: usize,
        value: Vec<u8>,
        with_response: bool,
        responder: Box<dyn WriteResponder>,
    },
    SubscribedClientsChanged {
        characteristic: Uuid,
        clients: Vec<String>,
    },
    AdvertisementStatusChanged {
        service: Uuid,
        status: AdvertisementStatus,
        error: Option<String>,
    },
}

// ----------------------------------------------------------------------------
// Native Driver
// ----------------------------------------------------------------------------

/// The `GattServiceProvider` calls the backend makes
///
/// Request and status events for every object created here are pushed to the
/// sink the driver was built with.
#[async_trait::async_trait]
pub trait ServiceProviderDriver: Send + Sync {
    /// Whether the Bluetooth radio is on
    async fn radio_on(&self) -> Result<bool>;

    async fn create_service(&mut self, uuid: Uuid) -> Result<()>;

    async fn create_characteristic(
        &mut self,
        service: Uuid,
        parameters: &LocalCharacteristicParameters,
    ) -> Result<()>;

    async fn create_descriptor(
        &mut self,
        characteristic: Uuid,
        parameters: &LocalDescriptorParameters,
    ) -> Result<()>;

    fn start_advertising(&mut self, service: Uuid, parameters: AdvertisingParameters) -> Result<()>;

    fn stop_advertising(&mut self, service: Uuid) -> Result<()>;

    fn advertisement_status(&self, service: Uuid) -> Result<AdvertisementStatus>;

    /// `NotifyValueAsync`; true when every subscribed client accepted it
    async fn notify_value(&self, characteristic: Uuid, value: &[u8]) -> Result<bool>;

    /// Drop every provider and local characteristic
    fn clear(&mut self);
}

/// How the backend learns that advertising started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMode {
    /// `AdvertisementStatusChanged` events
    Events,
    /// Read `AdvertisementStatus` until it settles
    Poll,
}

// ----------------------------------------------------------------------------
// Pump
// ----------------------------------------------------------------------------

type StatusMap = HashMap<Uuid, (AdvertisementStatus, Option<String>)>;

struct Shared {
    statuses: watch::Sender<StatusMap>,
    subscriptions: Mutex<SubscriptionSet>,
}

fn handle_event(dispatcher: &RequestDispatcher, shared: &Shared, event: WinRtEvent) {
    match event {
        WinRtEvent::ReadRequested {
            characteristic,
            central,
            offset,
            responder,
        } => {
            let mut ctx = RequestContext::new().with_offset(offset);
            if let Some(central) = central {
                ctx = ctx.with_central(central);
            }
            match dispatcher.answer_read(characteristic, &ctx) {
                Ok(value) => responder.respond_with_value(&value),
                Err(code) => responder.respond_with_error(code),
            }
        }
        WinRtEvent::WriteRequested {
            characteristic,
            central,
            offset,
            value,
            with_response,
            responder,
        } => {
            let mut ctx = RequestContext::new()
                .with_offset(offset)
                .with_response(with_response);
            if let Some(central) = central {
                ctx = ctx.with_central(central);
            }
            let result = dispatcher.answer_write(characteristic, value, &ctx);
            if with_response {
                match result {
                    Ok(()) => responder.respond(),
                    Err(code) => responder.respond_with_error(code),
                }
            }
        }
        WinRtEvent::SubscribedClientsChanged {
            characteristic,
            clients,
        } => {
            debug!(%characteristic, count = clients.len(), "Subscribed clients changed");
            shared.subscriptions.lock().reconcile(characteristic, &clients);
        }
        WinRtEvent::AdvertisementStatusChanged {
            service,
            status,
            error,
        } => {
            info!(%service, ?status, "Advertisement status changed");
            shared.statuses.send_modify(|statuses| {
                statuses.insert(service, (status, error));
            });
        }
    }
}

/// Outcome of waiting for every service to start advertising
fn settled(services: &[Uuid], statuses: &StatusMap) -> Option<Result<()>> {
    for service in services {
        if let Some((AdvertisementStatus::Aborted, error)) = statuses.get(service) {
            let reason = error
                .clone()
                .unwrap_or_else(|| format!("advertisement for {} aborted", service));
            return Some(Err(BackendError::AdvertisingFailed { reason }.into()));
        }
    }
    services
        .iter()
        .all(|s| statuses.get(s).is_some_and(|(status, _)| status.is_started()))
        .then_some(Ok(()))
}

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

pub struct WinRtBackend {
    driver: Box<dyn ServiceProviderDriver>,
    shared: Arc<Shared>,
    statuses: watch::Receiver<StatusMap>,
    mode: StatusMode,
    services: Vec<Uuid>,
    pump: JoinHandle<()>,
}

impl WinRtBackend {
    #[cfg(all(target_os = "windows", feature = "winrt"))]
    pub fn new(dispatcher: RequestDispatcher) -> Result<Self> {
        let (sink, events) = EventSink::channel(BACKEND);
        let driver = native::WinRtServiceProvider::new(sink);
        Self::with_driver(dispatcher, Box::new(driver), events, StatusMode::Events)
    }

    /// Wire `driver` and the receiver of its event sink to `dispatcher`
    pub fn with_driver(
        dispatcher: RequestDispatcher,
        driver: Box<dyn ServiceProviderDriver>,
        events: tokio::sync::mpsc::UnboundedReceiver<WinRtEvent>,
        mode: StatusMode,
    ) -> Result<Self> {
        let (statuses_tx, statuses) = watch::channel(StatusMap::new());
        let shared = Arc::new(Shared {
            statuses: statuses_tx,
            subscriptions: Mutex::new(SubscriptionSet::new()),
        });
        let pump_shared = Arc::clone(&shared);
        let pump = spawn_pump(BACKEND, events, move |event| {
            handle_event(&dispatcher, &pump_shared, event)
        })?;

        Ok(Self {
            driver,
            shared,
            statuses,
            mode,
            services: Vec::new(),
            pump,
        })
    }

    pub fn mode(&self) -> StatusMode {
        self.mode
    }

    /// Published services with their current `AdvertisementStatus`
    pub fn advertisement_statuses(&self) -> Result<Vec<(Uuid, AdvertisementStatus)>> {
        self.services
            .iter()
            .map(|service| Ok((*service, self.driver.advertisement_status(*service)?)))
            .collect()
    }

    /// Push `value` to the subscribers of `characteristic`
    pub async fn notify_raw(&self, characteristic: Uuid, value: &[u8]) -> Result<bool> {
        self.driver.notify_value(characteristic, value).await
    }

    async fn wait_for_status_events(&mut self) -> Result<()> {
        let services = self.services.clone();
        let mut outcome = None;
        self.statuses
            .wait_for(|statuses| {
                outcome = settled(&services, statuses);
                outcome.is_some()
            })
            .await
            .map_err(|_| BackendError::PumpClosed {
                backend: BACKEND.to_string(),
            })?;
        outcome.unwrap_or(Ok(()))
    }

    async fn poll_status(&mut self) -> Result<()> {
        loop {
            let mut statuses = StatusMap::new();
            for service in &self.services {
                statuses.insert(*service, (self.driver.advertisement_status(*service)?, None));
            }
            if let Some(outcome) = settled(&self.services, &statuses) {
                return outcome;
            }
            tokio::time::sleep(STATUS_POLL).await;
        }
    }
}

impl Drop for WinRtBackend {
    fn drop(&mut self) {
        self.driver.clear();
        self.pump.abort();
    }
}

#[async_trait::async_trait]
impl GattBackend for WinRtBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::WinRt
    }

    fn supported_advertisement_fields(&self) -> &'static [AdvertisementField] {
        SUPPORTED_FIELDS
    }

    async fn wait_for_powered_on(&mut self) -> Result<()> {
        while !self.driver.radio_on().await? {
            tokio::time::sleep(STATUS_POLL).await;
        }
        Ok(())
    }

    async fn add_new_service(&mut self, service: &Service) -> Result<()> {
        self.driver.create_service(service.uuid()).await?;
        self.services.push(service.uuid());
        debug!(uuid = %service.uuid(), "Service provider created");
        Ok(())
    }

    async fn add_new_characteristic(
        &mut self,
        service: &Service,
        characteristic: &Characteristic,
    ) -> Result<()> {
        let permissions = characteristic.permissions();
        let parameters = LocalCharacteristicParameters {
            uuid: characteristic.uuid(),
            properties: flags::translate_properties(characteristic.properties()),
            read_protection: flags::read_protection(permissions),
            write_protection: flags::write_protection(permissions),
        };
        self.driver
            .create_characteristic(service.uuid(), &parameters)
            .await
    }

    async fn add_new_descriptor(
        &mut self,
        characteristic: &Characteristic,
        descriptor: &Descriptor,
    ) -> Result<()> {
        if descriptor.uuid() == bless_core::uuid_from_short(CCCD) {
            warn!(uuid = %descriptor.uuid(), "Windows manages this descriptor itself; skipped");
            return Ok(());
        }
        let permissions = descriptor.permissions();
        let parameters = LocalDescriptorParameters {
            uuid: descriptor.uuid(),
            read_protection: flags::read_protection(permissions),
            write_protection: flags::write_protection(permissions),
            value: descriptor.value(),
        };
        self.driver
            .create_descriptor(characteristic.uuid(), &parameters)
            .await
    }

    async fn register_services(&mut self, services: &[Service]) -> Result<()> {
        // Providers are live once created; publishing happens with advertising
        debug!(count = services.len(), "Service providers ready");
        Ok(())
    }

    async fn start_advertising(&mut self, payload: &AdvertisementPayload) -> Result<()> {
        let parameters = AdvertisingParameters::from_payload(payload);
        self.shared.statuses.send_modify(StatusMap::clear);
        for service in self.services.clone() {
            self.driver.start_advertising(service, parameters)?;
        }
        match self.mode {
            StatusMode::Events => self.wait_for_status_events().await,
            StatusMode::Poll => self.poll_status().await,
        }
    }

    async fn stop_advertising(&mut self) -> Result<()> {
        for service in self.services.clone() {
            self.driver.stop_advertising(service)?;
        }
        Ok(())
    }

    async fn unregister(&mut self) -> Result<()> {
        self.stop_advertising().await?;
        self.shared.subscriptions.lock().clear();
        // Providers stay: they are the service objects and cannot be recreated
        // without the tree
        Ok(())
    }

    async fn is_advertising(&self) -> Result<bool> {
        Ok(self
            .advertisement_statuses()?
            .iter()
            .any(|(_, status)| status.is_started()))
    }

    async fn is_connected(&self) -> Result<bool> {
        Ok(self.shared.subscriptions.lock().is_connected())
    }

    async fn update_value(&mut self, characteristic: &Characteristic) -> Result<bool> {
        self.notify_raw(characteristic.uuid(), &characteristic.value())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bless_core::{
        BlessError, CallbackRegistry, GattAttributePermissions, GattCharacteristicProperties,
        GattTree,
    };

    const SERVICE: &str = "a07498ca-ad5b-474e-940d-16f1fbe7e8cd";
    const CHARACTERISTIC: &str = "51ff12bb-3ed8-46e5-b4f9-d64e2fec021b";

    #[derive(Default)]
    struct ProviderLog {
        characteristics: Vec<LocalCharacteristicParameters>,
        advertising: Vec<(Uuid, AdvertisingParameters)>,
        status: Option<AdvertisementStatus>,
    }

    struct FakeProvider {
        log: Arc<Mutex<ProviderLog>>,
        sink: EventSink<WinRtEvent>,
        /// Status events to emit when advertising starts; none for poll tests
        emit: Option<AdvertisementStatus>,
    }

    #[async_trait::async_trait]
    impl ServiceProviderDriver for FakeProvider {
        async fn radio_on(&self) -> Result<bool> {
            Ok(true)
        }

        async fn create_service(&mut self, _uuid: Uuid) -> Result<()> {
            Ok(())
        }

        async fn create_characteristic(
            &mut self,
            _service: Uuid,
            parameters: &LocalCharacteristicParameters,
        ) -> Result<()> {
            self.log.lock().characteristics.push(parameters.clone());
            Ok(())
        }

        async fn create_descriptor(
            &mut self,
            _characteristic: Uuid,
            _parameters: &LocalDescriptorParameters,
        ) -> Result<()> {
            Ok(())
        }

        fn start_advertising(&mut self, service: Uuid, parameters: AdvertisingParameters) -> Result<()> {
            self.log.lock().advertising.push((service, parameters));
            if let Some(status) = self.emit {
                self.sink.push(WinRtEvent::AdvertisementStatusChanged {
                    service,
                    status,
                    error: None,
                });
            }
            Ok(())
        }

        fn stop_advertising(&mut self, _service: Uuid) -> Result<()> {
            self.log.lock().status = Some(AdvertisementStatus::Stopped);
            Ok(())
        }

        fn advertisement_status(&self, _service: Uuid) -> Result<AdvertisementStatus> {
            Ok(self.log.lock().status.unwrap_or(AdvertisementStatus::Created))
        }

        async fn notify_value(&self, _characteristic: Uuid, _value: &[u8]) -> Result<bool> {
            Ok(true)
        }

        fn clear(&mut self) {}
    }

    /// Counts answers and records which one was given
    #[derive(Clone, Default)]
    struct Answers {
        count: Arc<AtomicUsize>,
        last: Arc<Mutex<Option<std::result::Result<Vec<u8>, AttError>>>>,
    }

    impl ReadResponder for Answers {
        fn respond_with_value(self: Box<Self>, value: &[u8]) {
            self.count.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(Ok(value.to_vec()));
        }

        fn respond_with_error(self: Box<Self>, code: AttError) {
            self.count.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(Err(code));
        }
    }

    impl WriteResponder for Answers {
        fn respond(self: Box<Self>) {
            self.count.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(Ok(Vec::new()));
        }

        fn respond_with_error(self: Box<Self>, code: AttError) {
            self.count.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(Err(code));
        }
    }

    struct Harness {
        backend: WinRtBackend,
        sink: EventSink<WinRtEvent>,
        log: Arc<Mutex<ProviderLog>>,
        dispatcher: RequestDispatcher,
    }

    async fn harness(mode: StatusMode, emit: Option<AdvertisementStatus>) -> Harness {
        let tree = GattTree::new();
        let service = tree.add_service(SERVICE).unwrap();
        let characteristic = tree
            .add_characteristic(
                SERVICE,
                CHARACTERISTIC,
                GattCharacteristicProperties::READ
                    | GattCharacteristicProperties::WRITE
                    | GattCharacteristicProperties::WRITE_WITHOUT_RESPONSE,
                GattAttributePermissions::READABLE
                    | GattAttributePermissions::WRITEABLE
                    | GattAttributePermissions::READ_ENCRYPTION_REQUIRED,
                Some(b"abc".to_vec()),
            )
            .unwrap();
        let dispatcher = RequestDispatcher::new(tree, CallbackRegistry::new());
        dispatcher.callbacks().set_read(|attr, _| attr.value());
        dispatcher
            .callbacks()
            .set_write(|attr, value, _| attr.set_value(value));

        let (sink, events) = EventSink::channel(BACKEND);
        let log = Arc::new(Mutex::new(ProviderLog::default()));
        let driver = FakeProvider {
            log: log.clone(),
            sink: sink.clone(),
            emit,
        };
        let mut backend =
            WinRtBackend::with_driver(dispatcher.clone(), Box::new(driver), events, mode).unwrap();
        backend.add_new_service(&service).await.unwrap();
        backend
            .add_new_characteristic(&service, &characteristic)
            .await
            .unwrap();

        Harness {
            backend,
            sink,
            log,
            dispatcher,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn uuid(text: &str) -> Uuid {
        Uuid::parse_str(text).unwrap()
    }

    #[tokio::test]
    async fn test_characteristic_parameters_are_translated() {
        let h = harness(StatusMode::Events, None).await;
        let log = h.log.lock();
        let parameters = &log.characteristics[0];
        assert_eq!(parameters.properties, 0x0002 | 0x0004 | 0x0008);
        assert_eq!(parameters.read_protection, ProtectionLevel::EncryptionRequired);
        assert_eq!(parameters.write_protection, ProtectionLevel::Plain);
    }

    #[tokio::test]
    async fn test_status_event_completes_start() {
        let mut h = harness(StatusMode::Events, Some(AdvertisementStatus::Started)).await;
        let payload = AdvertisementPayload::build("x", &[], None, None, false);
        h.backend.start_advertising(&payload).await.unwrap();
        let advertising = h.log.lock().advertising.clone();
        assert_eq!(
            advertising,
            vec![(
                uuid(SERVICE),
                AdvertisingParameters {
                    connectable: true,
                    discoverable: true
                }
            )]
        );
    }

    #[tokio::test]
    async fn test_aborted_status_fails_start() {
        let mut h = harness(StatusMode::Events, Some(AdvertisementStatus::Aborted)).await;
        let payload = AdvertisementPayload::build("x", &[], None, None, false);
        let err = h.backend.start_advertising(&payload).await.unwrap_err();
        assert!(matches!(
            err,
            BlessError::Backend(BackendError::AdvertisingFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_poll_mode_reads_status() {
        let mut h = harness(StatusMode::Poll, None).await;
        h.log.lock().status = Some(AdvertisementStatus::StartedWithoutAllAdvertisementData);
        let payload = AdvertisementPayload::build("x", &[], None, None, false);
        h.backend.start_advertising(&payload).await.unwrap();
        assert!(h.backend.is_advertising().await.unwrap());

        h.backend.stop_advertising().await.unwrap();
        assert!(!h.backend.is_advertising().await.unwrap());
    }

    #[tokio::test]
    async fn test_requests_are_answered_once() {
        let h = harness(StatusMode::Events, None).await;
        let read = Answers::default();
        h.sink.push(WinRtEvent::ReadRequested {
            characteristic: uuid(CHARACTERISTIC),
            central: Some("BluetoothLE#1".to_string()),
            offset: 0,
            responder: Box::new(read.clone()),
        });
        let write = Answers::default();
        h.sink.push(WinRtEvent::WriteRequested {
            characteristic: uuid(CHARACTERISTIC),
            central: None,
            offset: 0,
            value: vec![0x0f],
            with_response: true,
            responder: Box::new(write.clone()),
        });
        let command = Answers::default();
        h.sink.push(WinRtEvent::WriteRequested {
            characteristic: uuid(CHARACTERISTIC),
            central: None,
            offset: 0,
            value: vec![0x10],
            with_response: false,
            responder: Box::new(command.clone()),
        });
        settle().await;

        assert_eq!(read.count.load(Ordering::SeqCst), 1);
        assert_eq!(read.last.lock().clone(), Some(Ok(b"abc".to_vec())));
        assert_eq!(write.count.load(Ordering::SeqCst), 1);
        // Write without response is not acknowledged
        assert_eq!(command.count.load(Ordering::SeqCst), 0);
        let characteristic = h.dispatcher.tree().get_characteristic(CHARACTERISTIC).unwrap();
        assert_eq!(characteristic.value(), vec![0x10]);
    }

    #[tokio::test]
    async fn test_unknown_characteristic_gets_protocol_error() {
        let h = harness(StatusMode::Events, None).await;
        let read = Answers::default();
        h.sink.push(WinRtEvent::ReadRequested {
            characteristic: Uuid::from_u128(7),
            central: None,
            offset: 0,
            responder: Box::new(read.clone()),
        });
        settle().await;
        assert_eq!(read.last.lock().clone(), Some(Err(AttError::AttributeNotFound)));
        assert!(h.dispatcher.faults().is_set());
    }

    #[tokio::test]
    async fn test_subscribed_clients_are_reconciled() {
        let h = harness(StatusMode::Events, None).await;
        h.sink.push(WinRtEvent::SubscribedClientsChanged {
            characteristic: uuid(CHARACTERISTIC),
            clients: vec!["BluetoothLE#1".to_string()],
        });
        settle().await;
        assert!(h.backend.is_connected().await.unwrap());

        h.sink.push(WinRtEvent::SubscribedClientsChanged {
            characteristic: uuid(CHARACTERISTIC),
            clients: Vec::new(),
        });
        settle().await;
        assert!(!h.backend.is_connected().await.unwrap());
    }
}
