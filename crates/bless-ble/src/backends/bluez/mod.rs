//! Linux BlueZ backend
//!
//! The GATT tree is exported as a D-Bus application and registered with
//! `org.bluez.GattManager1`; advertising goes through
//! `org.bluez.LEAdvertisingManager1`. Method calls BlueZ makes on exported
//! objects arrive as [`BluezEvent`]s keyed by object path and are routed
//! through the [`GattApplication`] model to the request dispatcher.

pub mod application;
pub mod flags;
#[cfg(all(target_os = "linux", feature = "bluez"))]
pub mod native;

use std::collections::HashMap;
use std::sync::Arc;

use bless_core::{
    AdvertisementField, AdvertisementPayload, AttError, BlessError, BackendKind,
    Characteristic, Descriptor, GattBackend, RequestContext, RequestDispatcher, Result, Service,
    SubscriptionSet,
};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use self::application::{GattApplication, LeAdvertisement};
use crate::bridge::{spawn_pump, EventSink};

const BACKEND: &str = "bluez";

/// Notify sessions carry no device address, so all subscriptions are
/// attributed to one logical central
pub const BLUEZ_CENTRAL: &str = "bluez";

/// Every field except connectability, which BlueZ derives from the type
const SUPPORTED_FIELDS: &[AdvertisementField] = &[
    AdvertisementField::LocalName,
    AdvertisementField::ServiceUuids,
    AdvertisementField::ManufacturerData,
    AdvertisementField::ServiceData,
    AdvertisementField::Discoverable,
    AdvertisementField::TxPower,
];

// ----------------------------------------------------------------------------
// D-Bus Errors
// ----------------------------------------------------------------------------

/// `org.bluez.Error.*` replies to GATT method calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BluezError {
    #[error("org.bluez.Error.Failed")]
    Failed,
    #[error("org.bluez.Error.InProgress")]
    InProgress,
    #[error("org.bluez.Error.NotPermitted")]
    NotPermitted,
    #[error("org.bluez.Error.InvalidValueLength")]
    InvalidValueLength,
    #[error("org.bluez.Error.InvalidOffset")]
    InvalidOffset,
    #[error("org.bluez.Error.NotAuthorized")]
    NotAuthorized,
    #[error("org.bluez.Error.NotSupported")]
    NotSupported,
}

impl From<AttError> for BluezError {
    fn from(code: AttError) -> Self {
        match code {
            AttError::InvalidOffset => BluezError::InvalidOffset,
            AttError::ReadNotPermitted | AttError::WriteNotPermitted => BluezError::NotPermitted,
            AttError::InvalidAttributeValueLength => BluezError::InvalidValueLength,
            AttError::InsufficientAuthentication
            | AttError::InsufficientAuthorization
            | AttError::InsufficientEncryption => BluezError::NotAuthorized,
            AttError::RequestNotSupported => BluezError::NotSupported,
            _ => BluezError::Failed,
        }
    }
}

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    Request,
    Command,
    Reliable,
}

/// `ReadValue`/`WriteValue` invoked on an exported characteristic or descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattMethodCall {
    ReadValue {
        path: String,
        offset: usize,
        mtu: Option<u16>,
        device: Option<String>,
    },
    WriteValue {
        path: String,
        value: Vec<u8>,
        offset: usize,
        write_type: WriteType,
        device: Option<String>,
    },
}

impl GattMethodCall {
    pub fn path(&self) -> &str {
        match self {
            GattMethodCall::ReadValue { path, .. } | GattMethodCall::WriteValue { path, .. } => path,
        }
    }
}

/// Live `StartNotify` session on one characteristic
pub trait NotifySession: Send {
    fn notify(&mut self, value: Vec<u8>) -> BoxFuture<'_, Result<()>>;

    fn is_stopped(&self) -> bool;
}

pub type MethodReply = oneshot::Sender<std::result::Result<Vec<u8>, BluezError>>;

pub enum BluezEvent {
    Call { call: GattMethodCall, reply: MethodReply },
    StartNotify { path: String, session: Box<dyn NotifySession> },
    StopNotify { path: String },
}

// ----------------------------------------------------------------------------
// Bus
// ----------------------------------------------------------------------------

/// The BlueZ calls the backend makes over D-Bus
#[async_trait::async_trait]
pub trait BluezBus: Send + Sync {
    /// Resolve once the adapter reports `Powered`, powering it on if needed
    async fn wait_powered(&mut self) -> Result<()>;

    /// Export `app` and `RegisterApplication`; method calls flow into `events`
    async fn register_application(
        &mut self,
        app: &GattApplication,
        events: EventSink<BluezEvent>,
    ) -> Result<()>;

    async fn unregister_application(&mut self) -> Result<()>;

    async fn register_advertisement(&mut self, advertisement: &LeAdvertisement) -> Result<()>;

    async fn unregister_advertisement(&mut self) -> Result<()>;

    /// `ActiveInstances` of `LEAdvertisingManager1`
    async fn active_advertising_instances(&self) -> Result<u8>;
}

// ----------------------------------------------------------------------------
// Routing
// ----------------------------------------------------------------------------

type SessionHandle = Arc<tokio::sync::Mutex<Box<dyn NotifySession>>>;

struct Shared {
    app: RwLock<GattApplication>,
    subscriptions: Mutex<SubscriptionSet>,
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
}

/// Resolve the call's object path and answer it through the dispatcher
pub fn route_call(
    dispatcher: &RequestDispatcher,
    app: &GattApplication,
    call: GattMethodCall,
) -> std::result::Result<Vec<u8>, BluezError> {
    let Some(uuid) = app.uuid_at(call.path()) else {
        dispatcher.faults().report(BlessError::DispatchMiss {
            uuid: call.path().to_string(),
        });
        return Err(BluezError::Failed);
    };

    match call {
        GattMethodCall::ReadValue {
            offset, mtu, device, ..
        } => {
            let mut ctx = RequestContext::new().with_offset(offset);
            if let Some(device) = device {
                ctx = ctx.with_central(device);
            }
            if let Some(mtu) = mtu {
                ctx = ctx.with_mtu(mtu);
            }
            Ok(dispatcher.answer_read(uuid, &ctx)?)
        }
        GattMethodCall::WriteValue {
            value,
            offset,
            write_type,
            device,
            ..
        } => {
            let mut ctx = RequestContext::new()
                .with_offset(offset)
                .with_response(write_type != WriteType::Command);
            if let Some(device) = device {
                ctx = ctx.with_central(device);
            }
            dispatcher.answer_write(uuid, value, &ctx)?;
            Ok(Vec::new())
        }
    }
}

fn handle_event(dispatcher: &RequestDispatcher, shared: &Shared, event: BluezEvent) {
    match event {
        BluezEvent::Call { call, reply } => {
            let result = route_call(dispatcher, &shared.app.read(), call);
            if reply.send(result).is_err() {
                debug!("Method call caller went away before the reply");
            }
        }
        BluezEvent::StartNotify { path, session } => {
            let Some(uuid) = shared.app.read().uuid_at(&path) else {
                warn!(path, "StartNotify on unknown object");
                return;
            };
            debug!(path, "StartNotify");
            shared
                .sessions
                .lock()
                .insert(uuid, Arc::new(tokio::sync::Mutex::new(session)));
            shared.subscriptions.lock().subscribe(BLUEZ_CENTRAL, uuid);
        }
        BluezEvent::StopNotify { path } => {
            let Some(uuid) = shared.app.read().uuid_at(&path) else {
                warn!(path, "StopNotify on unknown object");
                return;
            };
            debug!(path, "StopNotify");
            shared.sessions.lock().remove(&uuid);
            shared.subscriptions.lock().unsubscribe(BLUEZ_CENTRAL, uuid);
        }
    }
}

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

pub struct BluezBackend {
    bus: Box<dyn BluezBus>,
    shared: Arc<Shared>,
    sink: EventSink<BluezEvent>,
    pump: JoinHandle<()>,
    registered: bool,
}

impl BluezBackend {
    /// Connect to the system bus and open the default adapter
    #[cfg(all(target_os = "linux", feature = "bluez"))]
    pub async fn new(name: &str, dispatcher: RequestDispatcher) -> Result<Self> {
        let bus = native::BluerBus::connect().await?;
        Self::with_bus(name, dispatcher, Box::new(bus))
    }

    pub fn with_bus(name: &str, dispatcher: RequestDispatcher, bus: Box<dyn BluezBus>) -> Result<Self> {
        let shared = Arc::new(Shared {
            app: RwLock::new(GattApplication::new(name)),
            subscriptions: Mutex::new(SubscriptionSet::new()),
            sessions: Mutex::new(HashMap::new()),
        });
        let (sink, events) = EventSink::channel(BACKEND);
        let pump_shared = Arc::clone(&shared);
        let pump = spawn_pump(BACKEND, events, move |event| {
            handle_event(&dispatcher, &pump_shared, event)
        })?;

        Ok(Self {
            bus,
            shared,
            sink,
            pump,
            registered: false,
        })
    }

    /// Snapshot of the exported object tree
    pub fn application(&self) -> GattApplication {
        self.shared.app.read().clone()
    }
}

impl Drop for BluezBackend {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait::async_trait]
impl GattBackend for BluezBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::BlueZ
    }

    fn supported_advertisement_fields(&self) -> &'static [AdvertisementField] {
        SUPPORTED_FIELDS
    }

    async fn wait_for_powered_on(&mut self) -> Result<()> {
        self.bus.wait_powered().await
    }

    async fn add_new_service(&mut self, service: &Service) -> Result<()> {
        let mut app = self.shared.app.write();
        let node = app.add_service(service);
        debug!(path = %node.path, uuid = %node.uuid, "Service exported");
        Ok(())
    }

    async fn add_new_characteristic(
        &mut self,
        service: &Service,
        characteristic: &Characteristic,
    ) -> Result<()> {
        let mut app = self.shared.app.write();
        let node = app.add_characteristic(service, characteristic)?;
        debug!(path = %node.path, flags = ?node.flags, "Characteristic exported");
        Ok(())
    }

    async fn add_new_descriptor(
        &mut self,
        characteristic: &Characteristic,
        descriptor: &Descriptor,
    ) -> Result<()> {
        let mut app = self.shared.app.write();
        let node = app.add_descriptor(characteristic, descriptor)?;
        debug!(path = %node.path, flags = ?node.flags, "Descriptor exported");
        Ok(())
    }

    async fn register_services(&mut self, _services: &[Service]) -> Result<()> {
        // The whole tree is registered as one application
        let app = self.application();
        self.bus.register_application(&app, self.sink.clone()).await?;
        self.registered = true;
        info!(path = app.base_path(), "GATT application registered");
        Ok(())
    }

    async fn start_advertising(&mut self, payload: &AdvertisementPayload) -> Result<()> {
        let advertisement = self.shared.app.write().next_advertisement(payload);
        self.bus.register_advertisement(&advertisement).await?;
        info!(path = %advertisement.path, "Advertisement registered");
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<()> {
        self.bus.unregister_advertisement().await
    }

    async fn unregister(&mut self) -> Result<()> {
        self.bus.unregister_advertisement().await?;
        if self.registered {
            self.bus.unregister_application().await?;
            self.registered = false;
        }
        self.shared.sessions.lock().clear();
        self.shared.subscriptions.lock().clear();
        Ok(())
    }

    async fn is_advertising(&self) -> Result<bool> {
        Ok(self.bus.active_advertising_instances().await? > 0)
    }

    async fn is_connected(&self) -> Result<bool> {
        Ok(self.shared.subscriptions.lock().is_connected())
    }

    async fn update_value(&mut self, characteristic: &Characteristic) -> Result<bool> {
        let uuid = characteristic.uuid();
        let Some(session) = self.shared.sessions.lock().get(&uuid).cloned() else {
            // No one is subscribed; readers get the new value on their next read
            return Ok(true);
        };

        let mut session = session.lock().await;
        if session.is_stopped() {
            drop(session);
            self.shared.sessions.lock().remove(&uuid);
            self.shared.subscriptions.lock().unsubscribe(BLUEZ_CENTRAL, uuid);
            return Ok(false);
        }
        match session.notify(characteristic.value()).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(%uuid, "Notification failed: {}", e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bless_core::{CallbackRegistry, GattAttributePermissions, GattCharacteristicProperties, GattTree};

    const SERVICE: &str = "a07498ca-ad5b-474e-940d-16f1fbe7e8cd";
    const CHARACTERISTIC: &str = "51ff12bb-3ed8-46e5-b4f9-d64e2fec021b";
    const CHAR_PATH: &str = "/org/bluez/TestService/service0001/char0001";

    #[derive(Default)]
    struct BusLog {
        calls: Vec<String>,
        sink: Option<EventSink<BluezEvent>>,
        active: u8,
    }

    struct FakeBus(Arc<Mutex<BusLog>>);

    #[async_trait::async_trait]
    impl BluezBus for FakeBus {
        async fn wait_powered(&mut self) -> Result<()> {
            Ok(())
        }

        async fn register_application(
            &mut self,
            app: &GattApplication,
            events: EventSink<BluezEvent>,
        ) -> Result<()> {
            let mut log = self.0.lock();
            log.calls.push(format!("register {}", app.base_path()));
            log.sink = Some(events);
            Ok(())
        }

        async fn unregister_application(&mut self) -> Result<()> {
            self.0.lock().calls.push("unregister".to_string());
            Ok(())
        }

        async fn register_advertisement(&mut self, advertisement: &LeAdvertisement) -> Result<()> {
            let mut log = self.0.lock();
            log.calls.push(format!("advertise {}", advertisement.path));
            log.active += 1;
            Ok(())
        }

        async fn unregister_advertisement(&mut self) -> Result<()> {
            let mut log = self.0.lock();
            log.active = log.active.saturating_sub(1);
            Ok(())
        }

        async fn active_advertising_instances(&self) -> Result<u8> {
            Ok(self.0.lock().active)
        }
    }

    struct FakeSession {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        stopped: bool,
    }

    impl NotifySession for FakeSession {
        fn notify(&mut self, value: Vec<u8>) -> BoxFuture<'_, Result<()>> {
            self.sent.lock().push(value);
            Box::pin(async { Ok(()) })
        }

        fn is_stopped(&self) -> bool {
            self.stopped
        }
    }

    async fn backend() -> (BluezBackend, Arc<Mutex<BusLog>>, RequestDispatcher) {
        let tree = GattTree::new();
        let service = tree.add_service(SERVICE).unwrap();
        let characteristic = tree
            .add_characteristic(
                SERVICE,
                CHARACTERISTIC,
                GattCharacteristicProperties::READ
                    | GattCharacteristicProperties::WRITE
                    | GattCharacteristicProperties::NOTIFY,
                GattAttributePermissions::READABLE | GattAttributePermissions::WRITEABLE,
                Some(b"abc".to_vec()),
            )
            .unwrap();
        let dispatcher = RequestDispatcher::new(tree, CallbackRegistry::new());
        dispatcher.callbacks().set_read(|attr, _| attr.value());
        dispatcher
            .callbacks()
            .set_write(|attr, value, _| attr.set_value(value));

        let log = Arc::new(Mutex::new(BusLog::default()));
        let mut backend =
            BluezBackend::with_bus("Test Service", dispatcher.clone(), Box::new(FakeBus(log.clone())))
                .unwrap();
        backend.add_new_service(&service).await.unwrap();
        backend
            .add_new_characteristic(&service, &characteristic)
            .await
            .unwrap();
        backend.register_services(&[service]).await.unwrap();
        (backend, log, dispatcher)
    }

    fn sink(log: &Arc<Mutex<BusLog>>) -> EventSink<BluezEvent> {
        log.lock().sink.clone().unwrap()
    }

    async fn call(sink: &EventSink<BluezEvent>, call: GattMethodCall) -> std::result::Result<Vec<u8>, BluezError> {
        let (reply, rx) = oneshot::channel();
        assert!(sink.push(BluezEvent::Call { call, reply }));
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_read_and_write_route_by_path() {
        let (_backend, log, dispatcher) = backend().await;
        let sink = sink(&log);

        let read = GattMethodCall::ReadValue {
            path: CHAR_PATH.to_string(),
            offset: 1,
            mtu: Some(23),
            device: Some("/org/bluez/hci0/dev_00_11_22_33_44_55".to_string()),
        };
        assert_eq!(call(&sink, read).await.unwrap(), b"bc".to_vec());

        let write = GattMethodCall::WriteValue {
            path: CHAR_PATH.to_string(),
            value: vec![0x0f],
            offset: 0,
            write_type: WriteType::Request,
            device: None,
        };
        assert!(call(&sink, write).await.unwrap().is_empty());
        let characteristic = dispatcher.tree().get_characteristic(CHARACTERISTIC).unwrap();
        assert_eq!(characteristic.value(), vec![0x0f]);
    }

    #[tokio::test]
    async fn test_unknown_path_fails_and_faults() {
        let (_backend, log, dispatcher) = backend().await;
        let read = GattMethodCall::ReadValue {
            path: "/org/bluez/TestService/service0001/char0009".to_string(),
            offset: 0,
            mtu: None,
            device: None,
        };
        assert_eq!(call(&sink(&log), read).await.unwrap_err(), BluezError::Failed);
        assert!(matches!(
            dispatcher.faults().take(),
            Some(BlessError::DispatchMiss { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_past_end_is_invalid_offset() {
        let (_backend, log, _dispatcher) = backend().await;
        let read = GattMethodCall::ReadValue {
            path: CHAR_PATH.to_string(),
            offset: 10,
            mtu: None,
            device: None,
        };
        let err = call(&sink(&log), read).await.unwrap_err();
        assert_eq!(err, BluezError::InvalidOffset);
        assert_eq!(err.to_string(), "org.bluez.Error.InvalidOffset");
    }

    #[tokio::test]
    async fn test_notify_session_lifecycle() {
        let (mut backend, log, dispatcher) = backend().await;
        let sink = sink(&log);
        let sent = Arc::new(Mutex::new(Vec::new()));
        sink.push(BluezEvent::StartNotify {
            path: CHAR_PATH.to_string(),
            session: Box::new(FakeSession {
                sent: sent.clone(),
                stopped: false,
            }),
        });
        // A round trip through the pump orders the StartNotify before the checks
        let read = GattMethodCall::ReadValue {
            path: CHAR_PATH.to_string(),
            offset: 0,
            mtu: None,
            device: None,
        };
        call(&sink, read.clone()).await.unwrap();
        assert!(backend.is_connected().await.unwrap());

        let characteristic = dispatcher.tree().get_characteristic(CHARACTERISTIC).unwrap();
        characteristic.set_value(vec![7]);
        assert!(backend.update_value(&characteristic).await.unwrap());
        assert_eq!(sent.lock().clone(), vec![vec![7]]);

        sink.push(BluezEvent::StopNotify {
            path: CHAR_PATH.to_string(),
        });
        call(&sink, read).await.unwrap();
        assert!(!backend.is_connected().await.unwrap());
        assert!(backend.update_value(&characteristic).await.unwrap());
        assert_eq!(sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_advertising_and_unregister() {
        let (mut backend, log, _dispatcher) = backend().await;
        let payload = AdvertisementPayload::build("Test Service", &[], None, None, false);
        backend.start_advertising(&payload).await.unwrap();
        assert!(backend.is_advertising().await.unwrap());

        backend.unregister().await.unwrap();
        assert!(!backend.is_advertising().await.unwrap());
        assert_eq!(
            log.lock().calls,
            vec![
                "register /org/bluez/TestService".to_string(),
                "advertise /org/bluez/TestService/advertisement1".to_string(),
                "unregister".to_string(),
            ]
        );
    }

    #[test]
    fn test_att_error_mapping() {
        assert_eq!(BluezError::from(AttError::AttributeNotFound), BluezError::Failed);
        assert_eq!(BluezError::from(AttError::WriteNotPermitted), BluezError::NotPermitted);
    }
}
