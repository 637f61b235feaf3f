//! `BluezBus` over D-Bus using `bluer`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bless_core::{BackendError, Result};
use bluer::adv::{Advertisement, AdvertisementHandle, Type};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite, CharacteristicWriteMethod,
    Descriptor, DescriptorRead, DescriptorWrite, ReqError, Service,
};
use bluer::gatt::WriteOp;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::application::{CharacteristicNode, DescriptorNode, GattApplication, LeAdvertisement};
use super::flags::FlagList;
use super::{BluezBus, BluezError, BluezEvent, GattMethodCall, NotifySession, WriteType};
use crate::bridge::EventSink;

/// How often a notify session is checked for `StopNotify`
const NOTIFY_POLL: Duration = Duration::from_millis(250);
/// Polling interval while waiting for the adapter to power on
const POWER_POLL: Duration = Duration::from_millis(100);

fn bus_error(operation: &str, err: bluer::Error) -> BackendError {
    BackendError::Bus {
        reason: format!("{}: {}", operation, err),
    }
}

fn req_error(err: BluezError) -> ReqError {
    match err {
        BluezError::Failed => ReqError::Failed,
        BluezError::InProgress => ReqError::InProgress,
        BluezError::NotPermitted => ReqError::NotPermitted,
        BluezError::InvalidValueLength => ReqError::InvalidValueLength,
        BluezError::InvalidOffset => ReqError::InvalidOffset,
        BluezError::NotAuthorized => ReqError::NotAuthorized,
        BluezError::NotSupported => ReqError::NotSupported,
    }
}

fn write_type(op: WriteOp) -> WriteType {
    match op {
        WriteOp::Command => WriteType::Command,
        WriteOp::Reliable => WriteType::Reliable,
        _ => WriteType::Request,
    }
}

/// Hand a method call to the pump and wait for its answer
async fn dispatch(
    sink: EventSink<BluezEvent>,
    call: GattMethodCall,
) -> std::result::Result<Vec<u8>, ReqError> {
    let (reply, rx) = oneshot::channel();
    if !sink.push(BluezEvent::Call { call, reply }) {
        return Err(ReqError::Failed);
    }
    match rx.await {
        Ok(result) => result.map_err(req_error),
        Err(_) => Err(ReqError::Failed),
    }
}

// ----------------------------------------------------------------------------
// Notify Sessions
// ----------------------------------------------------------------------------

struct BluerSession {
    notifier: Arc<tokio::sync::Mutex<CharacteristicNotifier>>,
    stopped: Arc<AtomicBool>,
}

impl NotifySession for BluerSession {
    fn notify(&mut self, value: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.notifier
                .lock()
                .await
                .notify(value)
                .await
                .map_err(|e| bus_error("notify", e).into())
        })
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Publish a session, then watch it until the central stops notifications
async fn run_session(sink: EventSink<BluezEvent>, path: String, notifier: CharacteristicNotifier) {
    let notifier = Arc::new(tokio::sync::Mutex::new(notifier));
    let stopped = Arc::new(AtomicBool::new(false));
    let session = BluerSession {
        notifier: Arc::clone(&notifier),
        stopped: Arc::clone(&stopped),
    };
    if !sink.push(BluezEvent::StartNotify {
        path: path.clone(),
        session: Box::new(session),
    }) {
        return;
    }

    loop {
        tokio::time::sleep(NOTIFY_POLL).await;
        if notifier.lock().await.is_stopped() {
            stopped.store(true, Ordering::Release);
            sink.push(BluezEvent::StopNotify { path });
            return;
        }
    }
}

// ----------------------------------------------------------------------------
// Object Tree
// ----------------------------------------------------------------------------

fn has(flags: &FlagList, token: &str) -> bool {
    flags.iter().any(|f| *f == token)
}

fn characteristic(node: &CharacteristicNode, sink: &EventSink<BluezEvent>) -> Characteristic {
    let flags = &node.flags;
    let readable = has(flags, "read") || has(flags, "encrypt-read");
    let writable = has(flags, "write")
        || has(flags, "encrypt-write")
        || has(flags, "write-without-response")
        || has(flags, "reliable-write");

    let read = readable.then(|| {
        let (sink, path) = (sink.clone(), node.path.clone());
        CharacteristicRead {
            read: has(flags, "read"),
            encrypt_read: has(flags, "encrypt-read"),
            fun: Box::new(move |req| {
                let call = GattMethodCall::ReadValue {
                    path: path.clone(),
                    offset: usize::from(req.offset),
                    mtu: Some(req.mtu),
                    device: Some(req.device_address.to_string()),
                };
                Box::pin(dispatch(sink.clone(), call))
            }),
            ..Default::default()
        }
    });

    let write = writable.then(|| {
        let (sink, path) = (sink.clone(), node.path.clone());
        CharacteristicWrite {
            write: has(flags, "write"),
            encrypt_write: has(flags, "encrypt-write"),
            write_without_response: has(flags, "write-without-response"),
            reliable_write: has(flags, "reliable-write"),
            authenticated_signed_writes: has(flags, "authenticated-signed-writes"),
            method: CharacteristicWriteMethod::Fun(Box::new(move |value, req| {
                let call = GattMethodCall::WriteValue {
                    path: path.clone(),
                    value,
                    offset: usize::from(req.offset),
                    write_type: write_type(req.op_type),
                    device: Some(req.device_address.to_string()),
                };
                let sink = sink.clone();
                Box::pin(async move { dispatch(sink, call).await.map(|_| ()) })
            })),
            ..Default::default()
        }
    });

    let notify = (has(flags, "notify") || has(flags, "indicate")).then(|| {
        let (sink, path) = (sink.clone(), node.path.clone());
        CharacteristicNotify {
            notify: has(flags, "notify"),
            indicate: has(flags, "indicate"),
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                Box::pin(run_session(sink.clone(), path.clone(), notifier))
            })),
            ..Default::default()
        }
    });

    Characteristic {
        uuid: node.uuid,
        broadcast: has(flags, "broadcast"),
        writable_auxiliaries: has(flags, "writable-auxiliaries"),
        read,
        write,
        notify,
        descriptors: node.descriptors.iter().map(|d| descriptor(d, sink)).collect(),
        ..Default::default()
    }
}

fn descriptor(node: &DescriptorNode, sink: &EventSink<BluezEvent>) -> Descriptor {
    let flags = &node.flags;

    let read = (has(flags, "read") || has(flags, "encrypt-read")).then(|| {
        let (sink, path) = (sink.clone(), node.path.clone());
        DescriptorRead {
            read: has(flags, "read"),
            encrypt_read: has(flags, "encrypt-read"),
            fun: Box::new(move |req| {
                let call = GattMethodCall::ReadValue {
                    path: path.clone(),
                    offset: usize::from(req.offset),
                    mtu: None,
                    device: Some(req.device_address.to_string()),
                };
                Box::pin(dispatch(sink.clone(), call))
            }),
            ..Default::default()
        }
    });

    let write = (has(flags, "write") || has(flags, "encrypt-write")).then(|| {
        let (sink, path) = (sink.clone(), node.path.clone());
        DescriptorWrite {
            write: has(flags, "write"),
            encrypt_write: has(flags, "encrypt-write"),
            fun: Box::new(move |value, req| {
                let call = GattMethodCall::WriteValue {
                    path: path.clone(),
                    value,
                    offset: usize::from(req.offset),
                    write_type: WriteType::Request,
                    device: Some(req.device_address.to_string()),
                };
                let sink = sink.clone();
                Box::pin(async move { dispatch(sink, call).await.map(|_| ()) })
            }),
            ..Default::default()
        }
    });

    Descriptor {
        uuid: node.uuid,
        read,
        write,
        ..Default::default()
    }
}

fn application(app: &GattApplication, sink: &EventSink<BluezEvent>) -> Application {
    Application {
        services: app
            .services()
            .iter()
            .map(|service| Service {
                uuid: service.uuid,
                primary: service.primary,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(|c| characteristic(c, sink))
                    .collect(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn advertisement(adv: &LeAdvertisement) -> Advertisement {
    Advertisement {
        advertisement_type: Type::Peripheral,
        service_uuids: adv.service_uuids.iter().copied().collect(),
        local_name: adv.local_name.clone(),
        manufacturer_data: adv.manufacturer_data.clone(),
        service_data: adv.service_data.clone(),
        discoverable: adv.discoverable,
        tx_power: adv.tx_power,
        min_interval: Some(adv.min_interval),
        max_interval: Some(adv.max_interval),
        ..Default::default()
    }
}

// ----------------------------------------------------------------------------
// Bus
// ----------------------------------------------------------------------------

pub struct BluerBus {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    application: Option<ApplicationHandle>,
    advertisement: Option<AdvertisementHandle>,
}

impl BluerBus {
    pub async fn connect() -> Result<Self> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| BackendError::AdapterUnavailable {
                reason: format!("BlueZ session: {}", e),
            })?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| BackendError::AdapterUnavailable {
                reason: format!("BLE adapter: {}", e),
            })?;
        info!(adapter = adapter.name(), "BlueZ adapter opened");

        Ok(Self {
            _session: session,
            adapter,
            application: None,
            advertisement: None,
        })
    }
}

#[async_trait::async_trait]
impl BluezBus for BluerBus {
    async fn wait_powered(&mut self) -> Result<()> {
        if !self.adapter.is_powered().await.unwrap_or(false) {
            self.adapter
                .set_powered(true)
                .await
                .map_err(|e| bus_error("set_powered", e))?;
        }
        while !self
            .adapter
            .is_powered()
            .await
            .map_err(|e| bus_error("is_powered", e))?
        {
            tokio::time::sleep(POWER_POLL).await;
        }
        Ok(())
    }

    async fn register_application(
        &mut self,
        app: &GattApplication,
        events: EventSink<BluezEvent>,
    ) -> Result<()> {
        let handle = self
            .adapter
            .serve_gatt_application(application(app, &events))
            .await
            .map_err(|e| BackendError::Registration {
                reason: e.to_string(),
            })?;
        self.application = Some(handle);
        Ok(())
    }

    async fn unregister_application(&mut self) -> Result<()> {
        // Dropping the handle unregisters and unexports the tree
        if self.application.take().is_some() {
            debug!("GATT application unregistered");
        }
        Ok(())
    }

    async fn register_advertisement(&mut self, adv: &LeAdvertisement) -> Result<()> {
        let handle = self
            .adapter
            .advertise(advertisement(adv))
            .await
            .map_err(|e| BackendError::AdvertisingFailed {
                reason: e.to_string(),
            })?;
        self.advertisement = Some(handle);
        Ok(())
    }

    async fn unregister_advertisement(&mut self) -> Result<()> {
        if self.advertisement.take().is_some() {
            debug!("Advertisement unregistered");
        }
        Ok(())
    }

    async fn active_advertising_instances(&self) -> Result<u8> {
        self.adapter
            .active_advertising_instances()
            .await
            .map_err(|e| bus_error("ActiveInstances", e).into())
    }
}
