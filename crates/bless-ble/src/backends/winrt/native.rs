//! `ServiceProviderDriver` over the WinRT projections

use std::collections::HashMap;

use bless_core::{AttError, BackendError, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::{IInspectable, GUID};
use windows::Devices::Bluetooth::BluetoothError;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristicProperties, GattCommunicationStatus, GattLocalCharacteristic,
    GattLocalCharacteristicParameters, GattLocalDescriptorParameters, GattProtectionLevel,
    GattReadRequest, GattReadRequestedEventArgs, GattServiceProvider,
    GattServiceProviderAdvertisementStatusChangedEventArgs,
    GattServiceProviderAdvertisingParameters, GattSession, GattWriteOption, GattWriteRequest,
    GattWriteRequestedEventArgs,
};
use windows::Devices::Radios::{Radio, RadioKind, RadioState};
use windows::Foundation::{Deferral as NativeDeferral, TypedEventHandler};
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

use super::deferral::{Deferral, DeferralGuard};
use super::flags::ProtectionLevel;
use super::{
    AdvertisementStatus, AdvertisingParameters, LocalCharacteristicParameters,
    LocalDescriptorParameters, ReadResponder, ServiceProviderDriver, WinRtEvent, WriteResponder,
};
use crate::bridge::EventSink;

fn native(operation: &'static str) -> impl Fn(windows::core::Error) -> bless_core::BlessError {
    move |e| BackendError::native(operation, e.message()).into()
}

/// Wait on a WinRT operation off the async runtime
async fn blocking<T, F>(operation: &'static str, wait: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> windows::core::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(wait)
        .await
        .map_err(|e| BackendError::native(operation, e))?
        .map_err(native(operation))
}

fn guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn protection(level: ProtectionLevel) -> GattProtectionLevel {
    GattProtectionLevel(level.value())
}

fn buffer(value: &[u8]) -> windows::core::Result<IBuffer> {
    let writer = DataWriter::new()?;
    writer.WriteBytes(value)?;
    writer.DetachBuffer()
}

fn bytes(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut data = vec![0u8; buffer.Length()? as usize];
    reader.ReadBytes(&mut data)?;
    Ok(data)
}

fn device_id(session: &GattSession) -> Option<String> {
    session
        .DeviceId()
        .and_then(|id| id.Id())
        .map(|id| id.to_string())
        .ok()
}

// ----------------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------------

struct WinRtDeferral(NativeDeferral);

impl Deferral for WinRtDeferral {
    fn complete(&self) -> Result<()> {
        self.0.Complete().map_err(native("Deferral.Complete"))
    }
}

struct NativeReadResponder {
    request: GattReadRequest,
    _deferral: DeferralGuard<WinRtDeferral>,
}

impl ReadResponder for NativeReadResponder {
    fn respond_with_value(self: Box<Self>, value: &[u8]) {
        if let Err(e) = buffer(value).and_then(|b| self.request.RespondWithValue(&b)) {
            warn!("RespondWithValue failed: {}", e.message());
        }
    }

    fn respond_with_error(self: Box<Self>, code: AttError) {
        if let Err(e) = self.request.RespondWithProtocolError(code.code()) {
            warn!("RespondWithProtocolError failed: {}", e.message());
        }
    }
}

struct NativeWriteResponder {
    request: GattWriteRequest,
    _deferral: DeferralGuard<WinRtDeferral>,
}

impl WriteResponder for NativeWriteResponder {
    fn respond(self: Box<Self>) {
        if let Err(e) = self.request.Respond() {
            warn!("Respond failed: {}", e.message());
        }
    }

    fn respond_with_error(self: Box<Self>, code: AttError) {
        if let Err(e) = self.request.RespondWithProtocolError(code.code()) {
            warn!("RespondWithProtocolError failed: {}", e.message());
        }
    }
}

fn on_read(
    sink: &EventSink<WinRtEvent>,
    characteristic: Uuid,
    args: &GattReadRequestedEventArgs,
) -> windows::core::Result<()> {
    let deferral = DeferralGuard::new(WinRtDeferral(args.GetDeferral()?));
    let request = args.GetRequestAsync()?.get()?;
    let event = WinRtEvent::ReadRequested {
        characteristic,
        central: args.Session().ok().as_ref().and_then(device_id),
        offset: request.Offset()? as usize,
        responder: Box::new(NativeReadResponder {
            request,
            _deferral: deferral,
        }),
    };
    sink.push(event);
    Ok(())
}

fn on_write(
    sink: &EventSink<WinRtEvent>,
    characteristic: Uuid,
    args: &GattWriteRequestedEventArgs,
) -> windows::core::Result<()> {
    let deferral = DeferralGuard::new(WinRtDeferral(args.GetDeferral()?));
    let request = args.GetRequestAsync()?.get()?;
    let event = WinRtEvent::WriteRequested {
        characteristic,
        central: args.Session().ok().as_ref().and_then(device_id),
        offset: request.Offset()? as usize,
        value: bytes(&request.Value()?)?,
        with_response: request.Option()? == GattWriteOption::WriteWithResponse,
        responder: Box::new(NativeWriteResponder {
            request,
            _deferral: deferral,
        }),
    };
    sink.push(event);
    Ok(())
}

fn on_subscribers_changed(
    sink: &EventSink<WinRtEvent>,
    characteristic: Uuid,
    sender: &GattLocalCharacteristic,
) -> windows::core::Result<()> {
    let clients = sender
        .SubscribedClients()?
        .into_iter()
        .filter_map(|client| client.Session().ok().as_ref().and_then(device_id))
        .collect();
    sink.push(WinRtEvent::SubscribedClientsChanged {
        characteristic,
        clients,
    });
    Ok(())
}

// ----------------------------------------------------------------------------
// Driver
// ----------------------------------------------------------------------------

pub struct WinRtServiceProvider {
    sink: EventSink<WinRtEvent>,
    providers: HashMap<Uuid, GattServiceProvider>,
    characteristics: HashMap<Uuid, GattLocalCharacteristic>,
}

impl WinRtServiceProvider {
    pub fn new(sink: EventSink<WinRtEvent>) -> Self {
        Self {
            sink,
            providers: HashMap::new(),
            characteristics: HashMap::new(),
        }
    }

    fn provider(&self, service: Uuid) -> Result<&GattServiceProvider> {
        self.providers.get(&service).ok_or_else(|| {
            bless_core::BlessError::ServiceNotFound {
                uuid: service.to_string(),
            }
        })
    }
}

#[async_trait::async_trait]
impl ServiceProviderDriver for WinRtServiceProvider {
    async fn radio_on(&self) -> Result<bool> {
        let radios = blocking("Radio.GetRadiosAsync", || {
            Radio::GetRadiosAsync().and_then(|op| op.get())
        })
        .await?;
        for radio in radios {
            if radio.Kind().map_err(native("Radio.Kind"))? == RadioKind::Bluetooth {
                return Ok(radio.State().map_err(native("Radio.State"))? == RadioState::On);
            }
        }
        Err(BackendError::AdapterUnavailable {
            reason: "no Bluetooth radio".to_string(),
        }
        .into())
    }

    async fn create_service(&mut self, uuid: Uuid) -> Result<()> {
        let result = blocking("GattServiceProvider.CreateAsync", move || {
            GattServiceProvider::CreateAsync(guid(uuid)).and_then(|op| op.get())
        })
        .await?;
        let error = result.Error().map_err(native("Error"))?;
        if error != BluetoothError::Success {
            return Err(BackendError::AddServiceFailed {
                uuid: uuid.to_string(),
                reason: format!("BluetoothError {}", error.0),
            }
            .into());
        }
        let provider = result.ServiceProvider().map_err(native("ServiceProvider"))?;

        let sink = self.sink.clone();
        provider
            .AdvertisementStatusChanged(&TypedEventHandler::new(
                move |_sender: &Option<GattServiceProvider>,
                      args: &Option<GattServiceProviderAdvertisementStatusChangedEventArgs>| {
                    if let Some(args) = args {
                        let error = args.Error()?;
                        sink.push(WinRtEvent::AdvertisementStatusChanged {
                            service: uuid,
                            status: AdvertisementStatus::from_raw(args.Status()?.0),
                            error: (error != BluetoothError::Success)
                                .then(|| format!("BluetoothError {}", error.0)),
                        });
                    }
                    Ok(())
                },
            ))
            .map_err(native("AdvertisementStatusChanged"))?;

        self.providers.insert(uuid, provider);
        info!(%uuid, "GattServiceProvider created");
        Ok(())
    }

    async fn create_characteristic(
        &mut self,
        service: Uuid,
        parameters: &LocalCharacteristicParameters,
    ) -> Result<()> {
        let local_service = self
            .provider(service)?
            .Service()
            .map_err(native("GattServiceProvider.Service"))?;

        let native_parameters =
            GattLocalCharacteristicParameters::new().map_err(native("GattLocalCharacteristicParameters"))?;
        native_parameters
            .SetCharacteristicProperties(GattCharacteristicProperties(parameters.properties))
            .map_err(native("SetCharacteristicProperties"))?;
        native_parameters
            .SetReadProtectionLevel(protection(parameters.read_protection))
            .map_err(native("SetReadProtectionLevel"))?;
        native_parameters
            .SetWriteProtectionLevel(protection(parameters.write_protection))
            .map_err(native("SetWriteProtectionLevel"))?;

        let uuid = parameters.uuid;
        let result = blocking("CreateCharacteristicAsync", move || {
            local_service
                .CreateCharacteristicAsync(guid(uuid), &native_parameters)
                .and_then(|op| op.get())
        })
        .await?;
        let characteristic = result.Characteristic().map_err(native("Characteristic"))?;

        let sink = self.sink.clone();
        characteristic
            .ReadRequested(&TypedEventHandler::new(
                move |_sender: &Option<GattLocalCharacteristic>,
                      args: &Option<GattReadRequestedEventArgs>| {
                    if let Some(args) = args {
                        on_read(&sink, uuid, args)?;
                    }
                    Ok(())
                },
            ))
            .map_err(native("ReadRequested"))?;

        let sink = self.sink.clone();
        characteristic
            .WriteRequested(&TypedEventHandler::new(
                move |_sender: &Option<GattLocalCharacteristic>,
                      args: &Option<GattWriteRequestedEventArgs>| {
                    if let Some(args) = args {
                        on_write(&sink, uuid, args)?;
                    }
                    Ok(())
                },
            ))
            .map_err(native("WriteRequested"))?;

        let sink = self.sink.clone();
        characteristic
            .SubscribedClientsChanged(&TypedEventHandler::new(
                move |sender: &Option<GattLocalCharacteristic>, _args: &Option<IInspectable>| {
                    if let Some(sender) = sender {
                        on_subscribers_changed(&sink, uuid, sender)?;
                    }
                    Ok(())
                },
            ))
            .map_err(native("SubscribedClientsChanged"))?;

        debug!(%uuid, properties = parameters.properties, "Local characteristic created");
        self.characteristics.insert(uuid, characteristic);
        Ok(())
    }

    async fn create_descriptor(
        &mut self,
        characteristic: Uuid,
        parameters: &LocalDescriptorParameters,
    ) -> Result<()> {
        let local = self.characteristics.get(&characteristic).ok_or_else(|| {
            bless_core::BlessError::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            }
        })?;

        let native_parameters =
            GattLocalDescriptorParameters::new().map_err(native("GattLocalDescriptorParameters"))?;
        native_parameters
            .SetReadProtectionLevel(protection(parameters.read_protection))
            .map_err(native("SetReadProtectionLevel"))?;
        native_parameters
            .SetWriteProtectionLevel(protection(parameters.write_protection))
            .map_err(native("SetWriteProtectionLevel"))?;
        native_parameters
            .SetStaticValue(&buffer(&parameters.value).map_err(native("DataWriter"))?)
            .map_err(native("SetStaticValue"))?;

        let local = local.clone();
        let uuid = parameters.uuid;
        blocking("CreateDescriptorAsync", move || {
            local
                .CreateDescriptorAsync(guid(uuid), &native_parameters)
                .and_then(|op| op.get())
        })
        .await?;
        debug!(uuid = %parameters.uuid, "Local descriptor created");
        Ok(())
    }

    fn start_advertising(&mut self, service: Uuid, parameters: AdvertisingParameters) -> Result<()> {
        let native_parameters = GattServiceProviderAdvertisingParameters::new()
            .map_err(native("GattServiceProviderAdvertisingParameters"))?;
        native_parameters
            .SetIsConnectable(parameters.connectable)
            .map_err(native("SetIsConnectable"))?;
        native_parameters
            .SetIsDiscoverable(parameters.discoverable)
            .map_err(native("SetIsDiscoverable"))?;
        self.provider(service)?
            .StartAdvertisingWithParameters(&native_parameters)
            .map_err(|e| {
                BackendError::AdvertisingFailed {
                    reason: e.message().to_string(),
                }
                .into()
            })
    }

    fn stop_advertising(&mut self, service: Uuid) -> Result<()> {
        self.provider(service)?
            .StopAdvertising()
            .map_err(native("StopAdvertising"))
    }

    fn advertisement_status(&self, service: Uuid) -> Result<AdvertisementStatus> {
        let status = self
            .provider(service)?
            .AdvertisementStatus()
            .map_err(native("AdvertisementStatus"))?;
        Ok(AdvertisementStatus::from_raw(status.0))
    }

    async fn notify_value(&self, characteristic: Uuid, value: &[u8]) -> Result<bool> {
        let Some(local) = self.characteristics.get(&characteristic).cloned() else {
            warn!(%characteristic, "No local characteristic to notify");
            return Ok(false);
        };
        let payload = buffer(value).map_err(native("DataWriter"))?;
        let results = blocking("NotifyValueAsync", move || {
            local.NotifyValueAsync(&payload).and_then(|op| op.get())
        })
        .await?;
        let mut delivered = true;
        for result in results {
            if result.Status().map_err(native("Status"))? != GattCommunicationStatus::Success {
                delivered = false;
            }
        }
        Ok(delivered)
    }

    fn clear(&mut self) {
        for provider in self.providers.values() {
            let _ = provider.StopAdvertising();
        }
        self.characteristics.clear();
        self.providers.clear();
    }
}
