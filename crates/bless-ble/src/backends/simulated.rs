//! In-process peripheral with no radio
//!
//! Runs the same sink/pump bridge as the native backends, with a
//! [`SimulatedCentral`] standing in for the remote device. Power state and
//! advertising failures can be scripted, which makes the lifecycle testable on
//! any host.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bless_core::{
    AdvertisementField, AdvertisementPayload, AttError, BackendError, BackendKind, BlessError,
    BlessServer, CallbackRegistry, Characteristic, Descriptor, GattBackend, GattTree,
    IntoGattUuid, RequestContext, RequestDispatcher, Result, ServerConfig, Service,
    SubscriptionSet,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::{spawn_pump, EventSink};

const BACKEND: &str = "simulated";

/// Fields a simulated advertisement carries
const SUPPORTED_FIELDS: &[AdvertisementField] = &[
    AdvertisementField::LocalName,
    AdvertisementField::ServiceUuids,
    AdvertisementField::ManufacturerData,
    AdvertisementField::ServiceData,
    AdvertisementField::Connectable,
    AdvertisementField::Discoverable,
    AdvertisementField::TxPower,
];

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Requests a simulated central makes of the peripheral
#[derive(Debug)]
pub enum SimulatedEvent {
    Read {
        central: String,
        uuid: Uuid,
        offset: usize,
        reply: oneshot::Sender<std::result::Result<Vec<u8>, AttError>>,
    },
    Write {
        central: String,
        uuid: Uuid,
        value: Vec<u8>,
        with_response: bool,
        reply: oneshot::Sender<std::result::Result<(), AttError>>,
    },
    Subscribe {
        central: String,
        uuid: Uuid,
        done: oneshot::Sender<()>,
    },
    Unsubscribe {
        central: String,
        uuid: Uuid,
        done: oneshot::Sender<()>,
    },
    Disconnect {
        central: String,
        done: oneshot::Sender<()>,
    },
}

/// A value pushed to a subscribed central
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub central: String,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Shared Radio State
// ----------------------------------------------------------------------------

struct SimulatedRadio {
    powered: watch::Sender<bool>,
    advertising: AtomicBool,
    stalled_adverts: AtomicU32,
    failing_adverts: AtomicU32,
    registered: Mutex<Vec<Uuid>>,
    advertisement: Mutex<Option<AdvertisementPayload>>,
    subscriptions: Mutex<SubscriptionSet>,
    notifications: mpsc::UnboundedSender<Notification>,
}

impl SimulatedRadio {
    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

// ----------------------------------------------------------------------------
// Simulated Central
// ----------------------------------------------------------------------------

/// Remote-device handle for driving a [`SimulatedBackend`]
#[derive(Clone)]
pub struct SimulatedCentral {
    id: String,
    sink: EventSink<SimulatedEvent>,
    radio: Arc<SimulatedRadio>,
    notifications: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Notification>>>,
}

impl SimulatedCentral {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Another central sharing this radio
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..self.clone()
        }
    }

    pub fn set_powered(&self, powered: bool) {
        self.radio.powered.send_replace(powered);
    }

    /// Leave the next `count` advertising requests unconfirmed
    pub fn stall_advertising(&self, count: u32) {
        self.radio.stalled_adverts.store(count, Ordering::SeqCst);
    }

    /// Reject the next `count` advertising requests
    pub fn fail_advertising(&self, count: u32) {
        self.radio.failing_adverts.store(count, Ordering::SeqCst);
    }

    pub fn is_advertising(&self) -> bool {
        self.radio.advertising.load(Ordering::SeqCst)
    }

    /// The payload most recently put on air
    pub fn advertisement(&self) -> Option<AdvertisementPayload> {
        self.radio.advertisement.lock().clone()
    }

    /// Services currently registered, in registration order
    pub fn registered_services(&self) -> Vec<Uuid> {
        self.radio.registered.lock().clone()
    }

    pub async fn read(&self, uuid: impl IntoGattUuid) -> std::result::Result<Vec<u8>, AttError> {
        self.read_at(uuid, 0).await
    }

    pub async fn read_at(
        &self,
        uuid: impl IntoGattUuid,
        offset: usize,
    ) -> std::result::Result<Vec<u8>, AttError> {
        let uuid = uuid.into_gatt_uuid().map_err(|_| AttError::InvalidHandle)?;
        let (reply, response) = oneshot::channel();
        self.sink.push(SimulatedEvent::Read {
            central: self.id.clone(),
            uuid,
            offset,
            reply,
        });
        response.await.unwrap_or(Err(AttError::UnlikelyError))
    }

    pub async fn write(&self, uuid: impl IntoGattUuid, value: Vec<u8>) -> std::result::Result<(), AttError> {
        self.send_write(uuid, value, true).await
    }

    pub async fn write_without_response(
        &self,
        uuid: impl IntoGattUuid,
        value: Vec<u8>,
    ) -> std::result::Result<(), AttError> {
        self.send_write(uuid, value, false).await
    }

    async fn send_write(
        &self,
        uuid: impl IntoGattUuid,
        value: Vec<u8>,
        with_response: bool,
    ) -> std::result::Result<(), AttError> {
        let uuid = uuid.into_gatt_uuid().map_err(|_| AttError::InvalidHandle)?;
        let (reply, response) = oneshot::channel();
        self.sink.push(SimulatedEvent::Write {
            central: self.id.clone(),
            uuid,
            value,
            with_response,
            reply,
        });
        response.await.unwrap_or(Err(AttError::UnlikelyError))
    }

    pub async fn subscribe(&self, uuid: impl IntoGattUuid) -> Result<()> {
        let uuid = uuid.into_gatt_uuid()?;
        let (done, ack) = oneshot::channel();
        self.sink.push(SimulatedEvent::Subscribe {
            central: self.id.clone(),
            uuid,
            done,
        });
        ack.await.map_err(|_| pump_closed())
    }

    pub async fn unsubscribe(&self, uuid: impl IntoGattUuid) -> Result<()> {
        let uuid = uuid.into_gatt_uuid()?;
        let (done, ack) = oneshot::channel();
        self.sink.push(SimulatedEvent::Unsubscribe {
            central: self.id.clone(),
            uuid,
            done,
        });
        ack.await.map_err(|_| pump_closed())
    }

    pub async fn disconnect(&self) -> Result<()> {
        let (done, ack) = oneshot::channel();
        self.sink.push(SimulatedEvent::Disconnect {
            central: self.id.clone(),
            done,
        });
        ack.await.map_err(|_| pump_closed())
    }

    /// Wait for the next value pushed to any central on this radio
    pub async fn next_notification(&self) -> Option<Notification> {
        self.notifications.lock().await.recv().await
    }

    pub fn try_notification(&self) -> Option<Notification> {
        self.notifications.try_lock().ok()?.try_recv().ok()
    }
}

fn pump_closed() -> BlessError {
    BackendError::PumpClosed {
        backend: BACKEND.to_string(),
    }
    .into()
}

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

/// A [`GattBackend`] that keeps everything in memory
pub struct SimulatedBackend {
    radio: Arc<SimulatedRadio>,
    powered: watch::Receiver<bool>,
    materialized: Vec<Uuid>,
    pump: JoinHandle<()>,
}

impl SimulatedBackend {
    /// Create the backend and the central that drives it
    ///
    /// Must be called inside a tokio runtime; the radio starts powered on.
    pub fn new(dispatcher: RequestDispatcher) -> Result<(Self, SimulatedCentral)> {
        let (powered_tx, powered) = watch::channel(true);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let radio = Arc::new(SimulatedRadio {
            powered: powered_tx,
            advertising: AtomicBool::new(false),
            stalled_adverts: AtomicU32::new(0),
            failing_adverts: AtomicU32::new(0),
            registered: Mutex::new(Vec::new()),
            advertisement: Mutex::new(None),
            subscriptions: Mutex::new(SubscriptionSet::new()),
            notifications: notify_tx,
        });

        let (sink, events) = EventSink::channel(BACKEND);
        let pump_radio = Arc::clone(&radio);
        let pump = spawn_pump(BACKEND, events, move |event| {
            handle_event(&dispatcher, &pump_radio, event)
        })?;

        let central = SimulatedCentral {
            id: "simulated-central".to_string(),
            sink,
            radio: Arc::clone(&radio),
            notifications: Arc::new(tokio::sync::Mutex::new(notify_rx)),
        };

        Ok((
            Self {
                radio,
                powered,
                materialized: Vec::new(),
                pump,
            },
            central,
        ))
    }
}

fn handle_event(dispatcher: &RequestDispatcher, radio: &SimulatedRadio, event: SimulatedEvent) {
    match event {
        SimulatedEvent::Read {
            central,
            uuid,
            offset,
            reply,
        } => {
            let ctx = RequestContext::new().with_central(central).with_offset(offset);
            let _ = reply.send(dispatcher.answer_read(uuid, &ctx));
        }
        SimulatedEvent::Write {
            central,
            uuid,
            value,
            with_response,
            reply,
        } => {
            let ctx = RequestContext::new()
                .with_central(central)
                .with_response(with_response);
            let _ = reply.send(dispatcher.answer_write(uuid, value, &ctx));
        }
        SimulatedEvent::Subscribe { central, uuid, done } => {
            let subscribable = dispatcher
                .tree()
                .get_characteristic(uuid)
                .map(|c| c.properties().is_subscribable())
                .unwrap_or(false);
            if !subscribable {
                warn!(%uuid, "Subscription to a characteristic without notify or indicate");
            }
            radio.subscriptions.lock().subscribe(&central, uuid);
            let _ = done.send(());
        }
        SimulatedEvent::Unsubscribe { central, uuid, done } => {
            radio.subscriptions.lock().unsubscribe(&central, uuid);
            let _ = done.send(());
        }
        SimulatedEvent::Disconnect { central, done } => {
            radio.subscriptions.lock().remove_central(&central);
            let _ = done.send(());
        }
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait::async_trait]
impl GattBackend for SimulatedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    fn supported_advertisement_fields(&self) -> &'static [AdvertisementField] {
        SUPPORTED_FIELDS
    }

    async fn wait_for_powered_on(&mut self) -> Result<()> {
        self.powered
            .wait_for(|powered| *powered)
            .await
            .map_err(|_| pump_closed())?;
        Ok(())
    }

    async fn add_new_service(&mut self, service: &Service) -> Result<()> {
        self.materialized.push(service.uuid());
        Ok(())
    }

    async fn add_new_characteristic(
        &mut self,
        _service: &Service,
        characteristic: &Characteristic,
    ) -> Result<()> {
        self.materialized.push(characteristic.uuid());
        Ok(())
    }

    async fn add_new_descriptor(
        &mut self,
        _characteristic: &Characteristic,
        descriptor: &Descriptor,
    ) -> Result<()> {
        self.materialized.push(descriptor.uuid());
        Ok(())
    }

    async fn register_services(&mut self, services: &[Service]) -> Result<()> {
        let mut registered = self.radio.registered.lock();
        registered.clear();
        for service in services {
            debug!(uuid = %service.uuid(), "Registering simulated service");
            registered.push(service.uuid());
        }
        Ok(())
    }

    async fn start_advertising(&mut self, payload: &AdvertisementPayload) -> Result<()> {
        if SimulatedRadio::take_one(&self.radio.failing_adverts) {
            return Err(BackendError::AdvertisingFailed {
                reason: "simulated advertising failure".to_string(),
            }
            .into());
        }
        if SimulatedRadio::take_one(&self.radio.stalled_adverts) {
            debug!("Simulated advertising start left unconfirmed");
            std::future::pending::<()>().await;
        }
        *self.radio.advertisement.lock() = Some(payload.clone());
        self.radio.advertising.store(true, Ordering::SeqCst);
        info!(name = ?payload.local_name, "Simulated advertising started");
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<()> {
        self.radio.advertising.store(false, Ordering::SeqCst);
        *self.radio.advertisement.lock() = None;
        Ok(())
    }

    async fn unregister(&mut self) -> Result<()> {
        self.radio.registered.lock().clear();
        self.radio.advertising.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_advertising(&self) -> Result<bool> {
        Ok(self.radio.advertising.load(Ordering::SeqCst))
    }

    async fn is_connected(&self) -> Result<bool> {
        Ok(self.radio.subscriptions.lock().is_connected())
    }

    async fn update_value(&mut self, characteristic: &Characteristic) -> Result<bool> {
        let value = characteristic.value();
        let uuid = characteristic.uuid();
        let subscribers = self.radio.subscriptions.lock().subscribers_of(&uuid);
        for central in subscribers {
            let notification = Notification {
                central,
                characteristic: uuid,
                value: value.clone(),
            };
            if self.radio.notifications.send(notification).is_err() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Build a server on a simulated radio and return the central driving it
pub fn create_simulated_server(
    config: ServerConfig,
) -> Result<(BlessServer<SimulatedBackend>, SimulatedCentral)> {
    let dispatcher = RequestDispatcher::new(GattTree::new(), CallbackRegistry::new());
    let (backend, central) = SimulatedBackend::new(dispatcher.clone())?;
    let server = BlessServer::from_parts(config, dispatcher, backend)?;
    Ok((server, central))
}
