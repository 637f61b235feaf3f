//! Request dispatch
//!
//! Native bridges hand every inbound read or write to a [`RequestDispatcher`],
//! which resolves the UUID against the server's tree and calls the single
//! read or write callback registered on the server. Misses are errors: a
//! native stack only ever asks about attributes this server registered.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::att::AttError;
use crate::errors::{BlessError, CallbackKind, Result};
use crate::gatt::{GattAttribute, GattTree, IntoGattUuid};

// ----------------------------------------------------------------------------
// Callback Types
// ----------------------------------------------------------------------------

/// Read callback: returns the bytes to send back to the central
pub type ReadRequestFn = dyn Fn(&GattAttribute, &RequestContext) -> Vec<u8> + Send + Sync;

/// Write callback: receives the bytes the central wrote
pub type WriteRequestFn = dyn Fn(&GattAttribute, Vec<u8>, &RequestContext) + Send + Sync;

/// Context accompanying a request from a central
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Native identifier of the requesting central, when the stack reports it
    pub central: Option<String>,
    /// Offset for long reads/writes
    pub offset: usize,
    /// Whether the central expects a write acknowledgment
    pub with_response: bool,
    /// Negotiated ATT MTU
    pub mtu: Option<u16>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_central(mut self, central: impl Into<String>) -> Self {
        self.central = Some(central.into());
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_response(mut self, with_response: bool) -> Self {
        self.with_response = with_response;
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }
}

// ----------------------------------------------------------------------------
// Callback Registry
// ----------------------------------------------------------------------------

/// Exactly one read and one write callback per server
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    read: Arc<RwLock<Option<Arc<ReadRequestFn>>>>,
    write: Arc<RwLock<Option<Arc<WriteRequestFn>>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_read<F>(&self, func: F)
    where
        F: Fn(&GattAttribute, &RequestContext) -> Vec<u8> + Send + Sync + 'static,
    {
        *self.read.write() = Some(Arc::new(func));
    }

    pub fn set_write<F>(&self, func: F)
    where
        F: Fn(&GattAttribute, Vec<u8>, &RequestContext) + Send + Sync + 'static,
    {
        *self.write.write() = Some(Arc::new(func));
    }

    /// The registered read callback; unset is an error
    pub fn read_request_func(&self) -> Result<Arc<ReadRequestFn>> {
        self.read.read().clone().ok_or(BlessError::CallbackUndefined {
            kind: CallbackKind::Read,
        })
    }

    /// The registered write callback; unset is an error
    pub fn write_request_func(&self) -> Result<Arc<WriteRequestFn>> {
        self.write.read().clone().ok_or(BlessError::CallbackUndefined {
            kind: CallbackKind::Write,
        })
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("read", &self.read.read().is_some())
            .field("write", &self.write.read().is_some())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Fault Slot
// ----------------------------------------------------------------------------

/// Holds the first error raised while pumping native events
///
/// Event pumps have no caller to return an error to, so they park it here and
/// the server surfaces it on the next state query.
#[derive(Debug, Clone, Default)]
pub struct FaultSlot {
    fault: Arc<Mutex<Option<BlessError>>>,
}

impl FaultSlot {
    pub fn report(&self, err: BlessError) {
        error!("Fault while handling native event: {}", err);
        let mut slot = self.fault.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn take(&self) -> Option<BlessError> {
        self.fault.lock().take()
    }

    pub fn is_set(&self) -> bool {
        self.fault.lock().is_some()
    }
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

/// Routes inbound requests to the registered callbacks
#[derive(Debug, Clone, Default)]
pub struct RequestDispatcher {
    tree: GattTree,
    callbacks: CallbackRegistry,
    faults: FaultSlot,
}

impl RequestDispatcher {
    pub fn new(tree: GattTree, callbacks: CallbackRegistry) -> Self {
        Self {
            tree,
            callbacks,
            faults: FaultSlot::default(),
        }
    }

    pub fn tree(&self) -> &GattTree {
        &self.tree
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    pub fn faults(&self) -> &FaultSlot {
        &self.faults
    }

    /// Resolve a UUID from a native event to a live attribute
    pub fn resolve(&self, uuid: impl IntoGattUuid) -> Result<GattAttribute> {
        let uuid = uuid.into_gatt_uuid()?;
        self.tree
            .find_attribute(&uuid)
            .ok_or_else(|| BlessError::DispatchMiss {
                uuid: uuid.to_string(),
            })
    }

    /// Invoke the read callback for `uuid` and return its bytes
    pub fn read_request(&self, uuid: impl IntoGattUuid, ctx: &RequestContext) -> Result<Vec<u8>> {
        let attribute = self.resolve(uuid)?;
        let func = self.callbacks.read_request_func()?;
        let value = func(&attribute, ctx);
        debug!(
            uuid = %attribute.uuid(),
            central = ?ctx.central,
            "Read request answered with {}",
            hex::encode(&value)
        );
        Ok(value)
    }

    /// Invoke the write callback for `uuid` with the written bytes
    pub fn write_request(
        &self,
        uuid: impl IntoGattUuid,
        value: Vec<u8>,
        ctx: &RequestContext,
    ) -> Result<()> {
        let attribute = self.resolve(uuid)?;
        let func = self.callbacks.write_request_func()?;
        debug!(
            uuid = %attribute.uuid(),
            central = ?ctx.central,
            "Write request with {}",
            hex::encode(&value)
        );
        func(&attribute, value, ctx);
        Ok(())
    }

    /// Read path used by native bridges
    ///
    /// Errors are parked in the fault slot and mapped to the ATT code the
    /// bridge should send, so the central is never left without a response.
    pub fn answer_read(
        &self,
        uuid: impl IntoGattUuid,
        ctx: &RequestContext,
    ) -> std::result::Result<Vec<u8>, AttError> {
        let value = self.read_request(uuid, ctx).map_err(|e| self.fault(e))?;
        if ctx.offset > value.len() {
            warn!(offset = ctx.offset, len = value.len(), "Read offset past end of value");
            return Err(AttError::InvalidOffset);
        }
        Ok(value[ctx.offset..].to_vec())
    }

    /// Write path used by native bridges
    pub fn answer_write(
        &self,
        uuid: impl IntoGattUuid,
        value: Vec<u8>,
        ctx: &RequestContext,
    ) -> std::result::Result<(), AttError> {
        self.write_request(uuid, value, ctx).map_err(|e| self.fault(e))
    }

    fn fault(&self, err: BlessError) -> AttError {
        let code = match err {
            BlessError::DispatchMiss { .. } | BlessError::InvalidUuid { .. } => {
                AttError::AttributeNotFound
            }
            _ => AttError::UnlikelyError,
        };
        self.faults.report(err);
        code
    }
}
