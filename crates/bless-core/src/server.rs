//! Server façade
//!
//! [`BlessServer`] is what applications hold. It owns the GATT tree, the
//! callback registry and the lifecycle state, and drives whichever
//! [`GattBackend`] it was built with.

use std::ops::Deref;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::advertisement::AdvertisementPayload;
use crate::backend::{BackendKind, GattBackend};
use crate::config::ServerConfig;
use crate::definition::GattDefinition;
use crate::dispatch::{CallbackRegistry, ReadRequestFn, RequestContext, RequestDispatcher, WriteRequestFn};
use crate::errors::{BlessError, Result};
use crate::flags::{GattAttributePermissions, GattCharacteristicProperties, GattDescriptorProperties};
use crate::gatt::{Characteristic, Descriptor, GattAttribute, GattTree, IntoGattUuid, Service};
use crate::state::{ServerState, StateEvent, StateMachine};

// ----------------------------------------------------------------------------
// Server
// ----------------------------------------------------------------------------

/// A GATT peripheral server running on backend `B`
pub struct BlessServer<B: GattBackend> {
    config: ServerConfig,
    tree: GattTree,
    dispatcher: RequestDispatcher,
    backend: tokio::sync::Mutex<B>,
    machine: parking_lot::Mutex<StateMachine>,
    kind: BackendKind,
}

impl<B: GattBackend> BlessServer<B> {
    /// Validate `config` and build the backend around a fresh dispatcher
    pub fn new<F>(config: ServerConfig, build: F) -> Result<Self>
    where
        F: FnOnce(&ServerConfig, RequestDispatcher) -> Result<B>,
    {
        config.validate()?;
        let dispatcher = RequestDispatcher::new(GattTree::new(), CallbackRegistry::new());
        let backend = build(&config, dispatcher.clone())?;
        Self::from_parts(config, dispatcher, backend)
    }

    /// Assemble a server from a backend already wired to `dispatcher`
    ///
    /// Used when the backend has to be created asynchronously. The server
    /// adopts the dispatcher's tree.
    pub fn from_parts(config: ServerConfig, dispatcher: RequestDispatcher, backend: B) -> Result<Self> {
        config.validate()?;
        let tree = dispatcher.tree().clone();
        let kind = backend.kind();

        let mut machine = StateMachine::new();
        machine.apply(StateEvent::BackendCreated, "create")?;
        info!(name = %config.name, backend = %kind, "Created GATT server");

        Ok(Self {
            config,
            tree,
            dispatcher,
            backend: tokio::sync::Mutex::new(backend),
            machine: parking_lot::Mutex::new(machine),
            kind,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    /// Current lifecycle state; a pending native fault reads as `Faulted`
    pub fn state(&self) -> ServerState {
        let mut machine = self.machine.lock();
        if self.dispatcher.faults().is_set() && !machine.is_starting() {
            machine.fail();
        }
        machine.state()
    }

    /// Take the first error raised while handling native events, if any
    pub fn take_fault(&self) -> Option<BlessError> {
        self.dispatcher.faults().take()
    }

    /// Return a pending native fault as an error and mark the server faulted
    fn surface_fault(&self) -> Result<()> {
        let Some(err) = self.dispatcher.faults().take() else {
            return Ok(());
        };
        let mut machine = self.machine.lock();
        if !machine.is_starting() {
            machine.fail();
        }
        warn!(state = %machine.state(), "Surfacing fault from native event: {}", err);
        Err(err)
    }

    fn transition(&self, event: StateEvent, operation: &'static str) -> Result<ServerState> {
        self.machine.lock().apply(event, operation)
    }

    // ------------------------------------------------------------------------
    // Tree Construction
    // ------------------------------------------------------------------------

    pub async fn add_new_service(&self, uuid: impl IntoGattUuid) -> Result<Service> {
        let service = self.tree.add_service(uuid)?;
        self.backend.lock().await.add_new_service(&service).await?;
        debug!(uuid = %service.uuid(), primary = service.primary(), "Added service");
        Ok(service)
    }

    pub async fn add_new_characteristic(
        &self,
        service_uuid: impl IntoGattUuid,
        char_uuid: impl IntoGattUuid,
        properties: GattCharacteristicProperties,
        value: Option<Vec<u8>>,
        permissions: GattAttributePermissions,
    ) -> Result<Characteristic> {
        let service_uuid = service_uuid.into_gatt_uuid()?;
        let characteristic =
            self.tree
                .add_characteristic(service_uuid, char_uuid, properties, permissions, value)?;
        let service = self
            .tree
            .get_service(service_uuid)
            .ok_or_else(|| BlessError::ServiceNotFound {
                uuid: service_uuid.to_string(),
            })?;
        self.backend
            .lock()
            .await
            .add_new_characteristic(&service, &characteristic)
            .await?;
        debug!(
            uuid = %characteristic.uuid(),
            service = %service_uuid,
            ?properties,
            ?permissions,
            "Added characteristic"
        );
        Ok(characteristic)
    }

    pub async fn add_new_descriptor(
        &self,
        service_uuid: impl IntoGattUuid,
        char_uuid: impl IntoGattUuid,
        desc_uuid: impl IntoGattUuid,
        properties: GattDescriptorProperties,
        value: Option<Vec<u8>>,
        permissions: GattAttributePermissions,
    ) -> Result<Descriptor> {
        let char_uuid = char_uuid.into_gatt_uuid()?;
        let descriptor = self.tree.add_descriptor(
            service_uuid,
            char_uuid,
            desc_uuid,
            properties,
            permissions,
            value,
        )?;
        let characteristic =
            self.tree
                .get_characteristic(char_uuid)
                .ok_or_else(|| BlessError::CharacteristicNotFound {
                    uuid: char_uuid.to_string(),
                })?;
        self.backend
            .lock()
            .await
            .add_new_descriptor(&characteristic, &descriptor)
            .await?;
        debug!(uuid = %descriptor.uuid(), characteristic = %char_uuid, "Added descriptor");
        Ok(descriptor)
    }

    /// Register a whole declarative tree, in declaration order
    ///
    /// Stops at the first error; attributes added before it stay registered.
    pub async fn add_gatt(&self, definition: &GattDefinition) -> Result<()> {
        for service in &definition.services {
            let service_uuid = self.add_new_service(service.uuid.as_str()).await?.uuid();
            for characteristic in &service.characteristics {
                let char_uuid = self
                    .add_new_characteristic(
                        service_uuid,
                        characteristic.uuid.as_str(),
                        characteristic.properties,
                        characteristic.value.clone(),
                        characteristic.effective_permissions(),
                    )
                    .await?
                    .uuid();
                for descriptor in &characteristic.descriptors {
                    self.add_new_descriptor(
                        service_uuid,
                        char_uuid,
                        descriptor.uuid.as_str(),
                        descriptor.properties,
                        descriptor.value.clone(),
                        descriptor.effective_permissions(),
                    )
                    .await?;
                }
            }
        }
        info!(attributes = definition.attribute_count(), "Registered GATT definition");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    pub fn services(&self) -> Vec<Service> {
        self.tree.services()
    }

    pub fn get_service(&self, uuid: impl IntoGattUuid) -> Option<Service> {
        self.tree.get_service(uuid)
    }

    pub fn get_characteristic(&self, uuid: impl IntoGattUuid) -> Option<Characteristic> {
        self.tree.get_characteristic(uuid)
    }

    pub fn get_descriptor(&self, uuid: impl IntoGattUuid) -> Option<Descriptor> {
        self.tree.get_descriptor(uuid)
    }

    // ------------------------------------------------------------------------
    // Callbacks and Dispatch
    // ------------------------------------------------------------------------

    pub fn set_read_request_func<F>(&self, func: F)
    where
        F: Fn(&GattAttribute, &RequestContext) -> Vec<u8> + Send + Sync + 'static,
    {
        self.dispatcher.callbacks().set_read(func);
    }

    pub fn set_write_request_func<F>(&self, func: F)
    where
        F: Fn(&GattAttribute, Vec<u8>, &RequestContext) + Send + Sync + 'static,
    {
        self.dispatcher.callbacks().set_write(func);
    }

    pub fn read_request_func(&self) -> Result<Arc<ReadRequestFn>> {
        self.dispatcher.callbacks().read_request_func()
    }

    pub fn write_request_func(&self) -> Result<Arc<WriteRequestFn>> {
        self.dispatcher.callbacks().write_request_func()
    }

    pub fn read_request(&self, uuid: impl IntoGattUuid, ctx: &RequestContext) -> Result<Vec<u8>> {
        self.dispatcher.read_request(uuid, ctx)
    }

    pub fn write_request(
        &self,
        uuid: impl IntoGattUuid,
        value: Vec<u8>,
        ctx: &RequestContext,
    ) -> Result<()> {
        self.dispatcher.write_request(uuid, value, ctx)
    }

    /// Notify subscribers of the characteristic's current value
    pub async fn update_value(
        &self,
        service_uuid: impl IntoGattUuid,
        char_uuid: impl IntoGattUuid,
    ) -> Result<bool> {
        let service_uuid = service_uuid.into_gatt_uuid()?;
        let char_uuid = char_uuid.into_gatt_uuid()?;
        let service = self
            .tree
            .get_service(service_uuid)
            .ok_or_else(|| BlessError::ServiceNotFound {
                uuid: service_uuid.to_string(),
            })?;
        let characteristic =
            service
                .get_characteristic(char_uuid)
                .ok_or_else(|| BlessError::CharacteristicNotFound {
                    uuid: char_uuid.to_string(),
                })?;
        let sent = self.backend.lock().await.update_value(&characteristic).await?;
        debug!(uuid = %char_uuid, sent, "Updated characteristic value");
        Ok(sent)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Power on, register every service and start advertising
    ///
    /// Rejected while another `start()` is running or the server is already
    /// advertising. An advertising timeout re-runs the whole sequence up to
    /// `start_retries` times; any other failure leaves the server faulted.
    pub async fn start(&self) -> Result<()> {
        self.machine.lock().begin_start()?;
        info!(name = %self.config.name, backend = %self.kind, "Starting GATT server");

        let result = self.run_start().await;

        let mut machine = self.machine.lock();
        machine.finish_start();
        match &result {
            Ok(()) => info!(name = %self.config.name, "GATT server advertising"),
            Err(err) => {
                error!(backend = %self.kind, "Failed to start GATT server: {}", err);
                machine.fail();
            }
        }
        result
    }

    async fn run_start(&self) -> Result<()> {
        let mut backend = self.backend.lock().await;
        let mut retries = 0;

        loop {
            let powered_on_timeout = self.config.powered_on_timeout();
            match tokio::time::timeout(powered_on_timeout, backend.wait_for_powered_on()).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(BlessError::PoweredOnTimeout {
                        timeout: powered_on_timeout,
                    })
                }
            }
            self.transition(StateEvent::PoweredOn, "start")?;

            self.transition(StateEvent::RegistrationStarted, "start")?;
            let services = self.tree.services();
            backend.register_services(&services).await?;
            debug!(count = services.len(), "Services registered");

            let payload = self.advertisement_payload(&*backend);
            let advertising_timeout = self.config.advertising_timeout();
            let advertised =
                match tokio::time::timeout(advertising_timeout, backend.start_advertising(&payload))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(BlessError::AdvertisingTimeout {
                        timeout: advertising_timeout,
                    }),
                };

            match advertised {
                Ok(()) => {
                    self.transition(StateEvent::AdvertisingStarted, "start")?;
                    return Ok(());
                }
                Err(err) if err.is_retryable() && retries < self.config.start_retries => {
                    retries += 1;
                    warn!(attempt = retries, "{}; restarting", err);
                    backend.unregister().await?;
                    self.transition(StateEvent::RetryRequested, "start")?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn advertisement_payload(&self, backend: &B) -> AdvertisementPayload {
        if let Some(data) = &self.config.advertisement {
            data.warn_unsupported(self.kind.as_str(), backend.supported_advertisement_fields());
        }
        let uuids: Vec<_> = self.tree.services().iter().map(Service::uuid).collect();
        AdvertisementPayload::build(
            &self.config.name,
            &uuids,
            self.config.advertisement.as_ref(),
            backend.payload_budget(),
            self.config.name_priority,
        )
    }

    /// Stop advertising and clear native registration
    pub async fn stop(&self) -> Result<()> {
        {
            let mut machine = self.machine.lock();
            if machine.is_starting() {
                return Err(BlessError::InvalidState {
                    operation: "stop",
                    state: machine.state(),
                });
            }
            machine.apply(StateEvent::StopRequested, "stop")?;
        }
        info!(name = %self.config.name, "Stopping GATT server");

        let result = {
            let mut backend = self.backend.lock().await;
            match backend.stop_advertising().await {
                Ok(()) => backend.unregister().await,
                Err(err) => Err(err),
            }
        };

        match result {
            Ok(()) => {
                self.transition(StateEvent::Stopped, "stop")?;
                Ok(())
            }
            Err(err) => {
                error!(backend = %self.kind, "Failed to stop GATT server: {}", err);
                self.machine.lock().fail();
                Err(err)
            }
        }
    }

    /// Fails with the pending native fault, if one was raised
    pub async fn is_advertising(&self) -> Result<bool> {
        self.surface_fault()?;
        self.backend.lock().await.is_advertising().await
    }

    /// Fails with the pending native fault, if one was raised
    pub async fn is_connected(&self) -> Result<bool> {
        self.surface_fault()?;
        self.backend.lock().await.is_connected().await
    }
}

impl<B: GattBackend + 'static> BlessServer<B> {
    /// Start the server and return a guard that stops it again
    ///
    /// Prefer [`ServeGuard::shutdown`]; dropping the guard spawns the stop on
    /// the current runtime and cannot report its outcome.
    pub async fn serve(self: &Arc<Self>) -> Result<ServeGuard<B>> {
        self.start().await?;
        Ok(ServeGuard {
            server: Arc::clone(self),
            armed: true,
        })
    }
}

// ----------------------------------------------------------------------------
// Scoped Start Guard
// ----------------------------------------------------------------------------

/// Keeps a server advertising for as long as it is held
pub struct ServeGuard<B: GattBackend + 'static> {
    server: Arc<BlessServer<B>>,
    armed: bool,
}

impl<B: GattBackend + 'static> ServeGuard<B> {
    /// Stop the server and wait for it
    pub async fn shutdown(mut self) -> Result<()> {
        self.armed = false;
        self.server.stop().await
    }
}

impl<B: GattBackend + 'static> Deref for ServeGuard<B> {
    type Target = BlessServer<B>;

    fn deref(&self) -> &Self::Target {
        &self.server
    }
}

impl<B: GattBackend + 'static> Drop for ServeGuard<B> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let server = Arc::clone(&self.server);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = server.stop().await {
                        warn!("Failed to stop GATT server on drop: {}", err);
                    }
                });
            }
            Err(_) => warn!("ServeGuard dropped outside a runtime; server left running"),
        }
    }
}
