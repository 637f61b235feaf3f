//! Windows .NET bridge backend
//!
//! The UWP `GattServiceProvider` behind the same WinRT driver, driven the way
//! the .NET bridge drives it: advertising parameters are fixed to
//! connectable and discoverable, the start is confirmed by polling
//! `AdvertisementStatus`, and only `Started` counts as advertising.

use bless_core::{
    AdvertisementData, AdvertisementField, AdvertisementPayload, BackendKind, Characteristic,
    Descriptor, GattBackend, RequestDispatcher, Result, Service,
};
use tracing::debug;

use super::winrt::{AdvertisementStatus, ServiceProviderDriver, StatusMode, WinRtBackend, WinRtEvent};

pub struct DotNetBackend {
    inner: WinRtBackend,
}

impl DotNetBackend {
    #[cfg(all(target_os = "windows", feature = "winrt"))]
    pub fn new(dispatcher: RequestDispatcher) -> Result<Self> {
        let (sink, events) = crate::bridge::EventSink::channel("dotnet");
        let driver = super::winrt::native::WinRtServiceProvider::new(sink);
        Self::with_driver(dispatcher, Box::new(driver), events)
    }

    pub fn with_driver(
        dispatcher: RequestDispatcher,
        driver: Box<dyn ServiceProviderDriver>,
        events: tokio::sync::mpsc::UnboundedReceiver<WinRtEvent>,
    ) -> Result<Self> {
        Ok(Self {
            inner: WinRtBackend::with_driver(dispatcher, driver, events, StatusMode::Poll)?,
        })
    }
}

#[async_trait::async_trait]
impl GattBackend for DotNetBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DotNet
    }

    fn supported_advertisement_fields(&self) -> &'static [AdvertisementField] {
        &[]
    }

    async fn wait_for_powered_on(&mut self) -> Result<()> {
        self.inner.wait_for_powered_on().await
    }

    async fn add_new_service(&mut self, service: &Service) -> Result<()> {
        self.inner.add_new_service(service).await
    }

    async fn add_new_characteristic(
        &mut self,
        service: &Service,
        characteristic: &Characteristic,
    ) -> Result<()> {
        self.inner.add_new_characteristic(service, characteristic).await
    }

    async fn add_new_descriptor(
        &mut self,
        characteristic: &Characteristic,
        descriptor: &Descriptor,
    ) -> Result<()> {
        self.inner.add_new_descriptor(characteristic, descriptor).await
    }

    async fn register_services(&mut self, services: &[Service]) -> Result<()> {
        self.inner.register_services(services).await
    }

    async fn start_advertising(&mut self, payload: &AdvertisementPayload) -> Result<()> {
        let fixed = AdvertisementPayload {
            extra: AdvertisementData::default(),
            ..payload.clone()
        };
        self.inner.start_advertising(&fixed).await
    }

    async fn stop_advertising(&mut self) -> Result<()> {
        self.inner.stop_advertising().await
    }

    async fn unregister(&mut self) -> Result<()> {
        self.inner.unregister().await
    }

    async fn is_advertising(&self) -> Result<bool> {
        Ok(self
            .inner
            .advertisement_statuses()?
            .iter()
            .any(|(_, status)| *status == AdvertisementStatus::Started))
    }

    async fn is_connected(&self) -> Result<bool> {
        self.inner.is_connected().await
    }

    /// Fire and forget; the bridge reports success once the notify is sent
    async fn update_value(&mut self, characteristic: &Characteristic) -> Result<bool> {
        let mut value = characteristic.value();
        if value.is_empty() {
            value = vec![0];
        }
        let delivered = self.inner.notify_raw(characteristic.uuid(), &value).await?;
        debug!(uuid = %characteristic.uuid(), delivered, "Value pushed");
        // The .NET bridge reports success once the notify is queued
        Ok(true)
    }
}
