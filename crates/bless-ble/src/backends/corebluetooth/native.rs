//! `CBPeripheralManager` driver and its Objective-C delegate

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::sync::Once;

use bless_core::{normalize_uuid_str, uuid_from_short, AttError, BackendError, Result};
use cocoa::base::{id, nil};
use objc::declare::ClassDecl;
use objc::runtime::{Class, Object, Sel, BOOL, NO, YES};
use objc::{msg_send, sel, sel_impl};
use objc_foundation::{INSString, NSString};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AttRequest, CbService, ManagerState, PeripheralEvent, PeripheralManagerDriver, RequestToken,
};
use crate::bridge::EventSink;

#[link(name = "CoreBluetooth", kind = "framework")]
extern "C" {}

extern "C" {
    fn dispatch_queue_create(label: *const c_char, attr: *mut c_void) -> *mut c_void;
}

const DELEGATE_CLASS: &str = "BlessPeripheralManagerDelegate";
const SINK_IVAR: &str = "_blessSink";

/// User Description; CoreBluetooth wants an NSString value for it
const USER_DESCRIPTION: u32 = 0x2901;
/// Presentation Format
const PRESENTATION_FORMAT: u32 = 0x2904;

// ----------------------------------------------------------------------------
// Objective-C Helpers
// ----------------------------------------------------------------------------

fn class(name: &str) -> Result<&'static Class> {
    Class::get(name)
        .ok_or_else(|| BackendError::native("Class::get", format!("{} not available", name)).into())
}

unsafe fn ns_string(value: &str) -> id {
    let string = NSString::from_str(value);
    let raw: id = &*string as *const NSString as *mut Object;
    // Keep the string alive past the Rust wrapper
    let _: id = msg_send![raw, retain];
    let _: id = msg_send![raw, autorelease];
    raw
}

unsafe fn string_from_ns(string: id) -> Option<String> {
    if string == nil {
        return None;
    }
    let utf8: *const c_char = msg_send![string, UTF8String];
    if utf8.is_null() {
        return None;
    }
    Some(CStr::from_ptr(utf8).to_string_lossy().into_owned())
}

unsafe fn ns_data(bytes: &[u8]) -> Result<id> {
    let data: id = msg_send![class("NSData")?, dataWithBytes: bytes.as_ptr() as *const c_void length: bytes.len()];
    Ok(data)
}

unsafe fn bytes_from_ns_data(data: id) -> Vec<u8> {
    if data == nil {
        return Vec::new();
    }
    let length: usize = msg_send![data, length];
    let bytes: *const u8 = msg_send![data, bytes];
    if bytes.is_null() || length == 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(bytes, length).to_vec()
}

unsafe fn cb_uuid(uuid: &Uuid) -> Result<id> {
    let text = ns_string(&uuid.to_string());
    let cb_uuid: id = msg_send![class("CBUUID")?, UUIDWithString: text];
    Ok(cb_uuid)
}

/// `CBUUID` of any attribute, as a full 128-bit UUID
unsafe fn attribute_uuid(attribute: id) -> Option<Uuid> {
    let cb_uuid: id = msg_send![attribute, UUID];
    let text = string_from_ns(msg_send![cb_uuid, UUIDString])?;
    normalize_uuid_str(&text).ok()
}

unsafe fn central_identifier(central: id) -> String {
    let identifier: id = msg_send![central, identifier];
    string_from_ns(msg_send![identifier, UUIDString]).unwrap_or_default()
}

unsafe fn error_description(error: id) -> Option<String> {
    if error == nil {
        return None;
    }
    string_from_ns(msg_send![error, localizedDescription])
        .or_else(|| Some("unknown CoreBluetooth error".to_string()))
}

unsafe fn ns_array(objects: &[id]) -> Result<id> {
    let array: id = msg_send![class("NSArray")?, arrayWithObjects: objects.as_ptr() count: objects.len()];
    Ok(array)
}

// ----------------------------------------------------------------------------
// Delegate
// ----------------------------------------------------------------------------

unsafe fn sink(this: &Object) -> Option<&EventSink<PeripheralEvent>> {
    let raw: *mut c_void = *this.get_ivar(SINK_IVAR);
    (raw as *const EventSink<PeripheralEvent>).as_ref()
}

fn push(this: &Object, event: PeripheralEvent) {
    if let Some(sink) = unsafe { sink(this) } {
        sink.push(event);
    }
}

extern "C" fn did_update_state(this: &Object, _sel: Sel, manager: id) {
    let state: isize = unsafe { msg_send![manager, state] };
    push(
        this,
        PeripheralEvent::StateUpdated {
            state: ManagerState::from_raw(state),
        },
    );
}

extern "C" fn did_add_service(this: &Object, _sel: Sel, _manager: id, service: id, error: id) {
    let (uuid, error) = unsafe { (attribute_uuid(service), error_description(error)) };
    match uuid {
        Some(service) => push(this, PeripheralEvent::ServiceAdded { service, error }),
        None => warn!("didAddService with unreadable service UUID"),
    }
}

extern "C" fn did_start_advertising(this: &Object, _sel: Sel, _manager: id, error: id) {
    let error = unsafe { error_description(error) };
    push(this, PeripheralEvent::AdvertisingStarted { error });
}

extern "C" fn did_subscribe(this: &Object, _sel: Sel, _manager: id, central: id, characteristic: id) {
    let (central, uuid) = unsafe { (central_identifier(central), attribute_uuid(characteristic)) };
    if let Some(characteristic) = uuid {
        push(this, PeripheralEvent::CentralSubscribed { central, characteristic });
    }
}

extern "C" fn did_unsubscribe(this: &Object, _sel: Sel, _manager: id, central: id, characteristic: id) {
    let (central, uuid) = unsafe { (central_identifier(central), attribute_uuid(characteristic)) };
    if let Some(characteristic) = uuid {
        push(this, PeripheralEvent::CentralUnsubscribed { central, characteristic });
    }
}

/// Retain the native request and convert it; the pump releases it
unsafe fn att_request(request: id, with_value: bool) -> Option<AttRequest> {
    let characteristic: id = msg_send![request, characteristic];
    let uuid = attribute_uuid(characteristic)?;
    let central: id = msg_send![request, central];
    let offset: usize = msg_send![request, offset];
    let value = with_value.then(|| bytes_from_ns_data(msg_send![request, value]));
    let _: id = msg_send![request, retain];
    Some(AttRequest {
        token: RequestToken(request as usize),
        central: central_identifier(central),
        characteristic: uuid,
        offset,
        value,
    })
}

extern "C" fn did_receive_read(this: &Object, _sel: Sel, _manager: id, request: id) {
    if let Some(request) = unsafe { att_request(request, false) } {
        push(this, PeripheralEvent::ReadRequest(request));
    }
}

extern "C" fn did_receive_writes(this: &Object, _sel: Sel, _manager: id, requests: id) {
    let requests = unsafe {
        let count: usize = msg_send![requests, count];
        (0..count)
            .filter_map(|i| {
                let request: id = msg_send![requests, objectAtIndex: i];
                att_request(request, true)
            })
            .collect::<Vec<_>>()
    };
    if !requests.is_empty() {
        push(this, PeripheralEvent::WriteRequests(requests));
    }
}

extern "C" fn ready_to_update(this: &Object, _sel: Sel, _manager: id) {
    push(this, PeripheralEvent::ReadyToUpdateSubscribers);
}

fn delegate_class() -> Result<&'static Class> {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        let Some(superclass) = Class::get("NSObject") else {
            return;
        };
        let Some(mut decl) = ClassDecl::new(DELEGATE_CLASS, superclass) else {
            return;
        };
        decl.add_ivar::<*mut c_void>(SINK_IVAR);
        unsafe {
            decl.add_method(
                sel!(peripheralManagerDidUpdateState:),
                did_update_state as extern "C" fn(&Object, Sel, id),
            );
            decl.add_method(
                sel!(peripheralManager:didAddService:error:),
                did_add_service as extern "C" fn(&Object, Sel, id, id, id),
            );
            decl.add_method(
                sel!(peripheralManagerDidStartAdvertising:error:),
                did_start_advertising as extern "C" fn(&Object, Sel, id, id),
            );
            decl.add_method(
                sel!(peripheralManager:central:didSubscribeToCharacteristic:),
                did_subscribe as extern "C" fn(&Object, Sel, id, id, id),
            );
            decl.add_method(
                sel!(peripheralManager:central:didUnsubscribeFromCharacteristic:),
                did_unsubscribe as extern "C" fn(&Object, Sel, id, id, id),
            );
            decl.add_method(
                sel!(peripheralManager:didReceiveReadRequest:),
                did_receive_read as extern "C" fn(&Object, Sel, id, id),
            );
            decl.add_method(
                sel!(peripheralManager:didReceiveWriteRequests:),
                did_receive_writes as extern "C" fn(&Object, Sel, id, id),
            );
            decl.add_method(
                sel!(peripheralManagerIsReadyToUpdateSubscribers:),
                ready_to_update as extern "C" fn(&Object, Sel, id),
            );
        }
        decl.register();
    });
    class(DELEGATE_CLASS)
}

// ----------------------------------------------------------------------------
// Driver
// ----------------------------------------------------------------------------

/// Owned, retained Objective-C object
struct Retained(id);

impl Drop for Retained {
    fn drop(&mut self) {
        unsafe {
            let _: () = msg_send![self.0, release];
        }
    }
}

pub struct CbPeripheralManager {
    manager: id,
    delegate: id,
    sink: *mut EventSink<PeripheralEvent>,
    characteristics: Mutex<HashMap<Uuid, Retained>>,
}

// The manager serializes calls on its own queue; the raw pointers are only
// freed in Drop after the delegate is detached.
unsafe impl Send for CbPeripheralManager {}
unsafe impl Sync for CbPeripheralManager {}

impl CbPeripheralManager {
    pub fn new(sink: EventSink<PeripheralEvent>) -> Result<Self> {
        let delegate_class = delegate_class()?;
        let sink = Box::into_raw(Box::new(sink));

        unsafe {
            let delegate: id = msg_send![delegate_class, new];
            if delegate == nil {
                drop(Box::from_raw(sink));
                return Err(BackendError::native("alloc delegate", "nil").into());
            }
            (*delegate).set_ivar(SINK_IVAR, sink as *mut c_void);

            let queue = dispatch_queue_create(c"bless.peripheral".as_ptr(), std::ptr::null_mut());
            let manager: id = msg_send![class("CBPeripheralManager")?, alloc];
            let manager: id = msg_send![manager,
                initWithDelegate: delegate
                queue: queue as id
                options: nil
            ];
            if manager == nil {
                let _: () = msg_send![delegate, release];
                drop(Box::from_raw(sink));
                return Err(BackendError::native("CBPeripheralManager init", "nil").into());
            }

            info!("CBPeripheralManager initialized");
            Ok(Self {
                manager,
                delegate,
                sink,
                characteristics: Mutex::new(HashMap::new()),
            })
        }
    }

    unsafe fn build_service(&self, service: &CbService) -> Result<id> {
        let mutable_characteristic = class("CBMutableCharacteristic")?;
        let mutable_descriptor = class("CBMutableDescriptor")?;

        let mut characteristics = Vec::with_capacity(service.characteristics.len());
        for definition in &service.characteristics {
            let mut descriptors = Vec::new();
            for descriptor in &definition.descriptors {
                let value: id = if descriptor.uuid == uuid_from_short(USER_DESCRIPTION) {
                    ns_string(&String::from_utf8_lossy(&descriptor.value))
                } else if descriptor.uuid == uuid_from_short(PRESENTATION_FORMAT) {
                    ns_data(&descriptor.value)?
                } else {
                    // CBMutableDescriptor raises for any other type
                    warn!(uuid = %descriptor.uuid, "CoreBluetooth cannot publish descriptor; skipped");
                    continue;
                };
                let native: id = msg_send![mutable_descriptor, alloc];
                let native: id = msg_send![native,
                    initWithType: cb_uuid(&descriptor.uuid)?
                    value: value
                ];
                let _: id = msg_send![native, autorelease];
                descriptors.push(native);
            }

            // A nil value keeps the characteristic dynamic so every read is delegated
            let native: id = msg_send![mutable_characteristic, alloc];
            let native: id = msg_send![native,
                initWithType: cb_uuid(&definition.uuid)?
                properties: definition.properties
                value: nil
                permissions: definition.permissions
            ];
            if native == nil {
                return Err(BackendError::native("CBMutableCharacteristic init", definition.uuid).into());
            }
            if !descriptors.is_empty() {
                let _: () = msg_send![native, setDescriptors: ns_array(&descriptors)?];
            }
            self.characteristics.lock().insert(definition.uuid, Retained(native));
            characteristics.push(native);
        }

        let native: id = msg_send![class("CBMutableService")?, alloc];
        let primary: BOOL = if service.primary { YES } else { NO };
        let native: id = msg_send![native, initWithType: cb_uuid(&service.uuid)? primary: primary];
        if native == nil {
            return Err(BackendError::native("CBMutableService init", service.uuid).into());
        }
        let _: () = msg_send![native, setCharacteristics: ns_array(&characteristics)?];
        Ok(native)
    }
}

impl PeripheralManagerDriver for CbPeripheralManager {
    fn add_service(&self, service: &CbService) -> Result<()> {
        unsafe {
            let native = self.build_service(service)?;
            let _: () = msg_send![self.manager, addService: native];
            let _: () = msg_send![native, release];
        }
        debug!(uuid = %service.uuid, "addService requested");
        Ok(())
    }

    fn remove_all_services(&self) {
        unsafe {
            let _: () = msg_send![self.manager, removeAllServices];
        }
        self.characteristics.lock().clear();
    }

    fn start_advertising(&self, local_name: Option<&str>, service_uuids: &[Uuid]) {
        let result: Result<()> = unsafe {
            (|| {
                let mut keys = Vec::new();
                let mut values = Vec::new();
                if let Some(name) = local_name {
                    keys.push(ns_string("kCBAdvDataLocalName"));
                    values.push(ns_string(name));
                }
                if !service_uuids.is_empty() {
                    let uuids = service_uuids
                        .iter()
                        .map(|u| cb_uuid(u))
                        .collect::<Result<Vec<_>>>()?;
                    keys.push(ns_string("kCBAdvDataServiceUUIDs"));
                    values.push(ns_array(&uuids)?);
                }
                let data: id = msg_send![class("NSDictionary")?,
                    dictionaryWithObjects: values.as_ptr()
                    forKeys: keys.as_ptr()
                    count: keys.len()
                ];
                let _: () = msg_send![self.manager, startAdvertising: data];
                Ok(())
            })()
        };
        match result {
            Ok(()) => debug!(?local_name, count = service_uuids.len(), "startAdvertising requested"),
            Err(e) => {
                warn!("Could not build advertisement: {}", e);
                if let Some(sink) = unsafe { self.sink.as_ref() } {
                    sink.push(PeripheralEvent::AdvertisingStarted {
                        error: Some(e.to_string()),
                    });
                }
            }
        }
    }

    fn stop_advertising(&self) {
        unsafe {
            let _: () = msg_send![self.manager, stopAdvertising];
        }
    }

    fn is_advertising(&self) -> bool {
        let advertising: BOOL = unsafe { msg_send![self.manager, isAdvertising] };
        advertising != NO
    }

    fn respond(&self, token: RequestToken, result: AttError, value: Option<&[u8]>) {
        let request = token.0 as id;
        unsafe {
            if let Some(value) = value {
                match ns_data(value) {
                    Ok(data) => {
                        let _: () = msg_send![request, setValue: data];
                    }
                    Err(e) => warn!("Could not wrap read response: {}", e),
                }
            }
            let _: () = msg_send![self.manager,
                respondToRequest: request
                withResult: result.code() as isize
            ];
            let _: () = msg_send![request, release];
        }
    }

    fn release(&self, token: RequestToken) {
        unsafe {
            let _: () = msg_send![token.0 as id, release];
        }
    }

    fn update_value(&self, characteristic: &Uuid, value: &[u8]) -> bool {
        let characteristics = self.characteristics.lock();
        let Some(native) = characteristics.get(characteristic) else {
            warn!(uuid = %characteristic, "No native characteristic to update");
            return false;
        };
        unsafe {
            let Ok(data) = ns_data(value) else {
                return false;
            };
            let sent: BOOL = msg_send![self.manager,
                updateValue: data
                forCharacteristic: native.0
                onSubscribedCentrals: nil
            ];
            sent != NO
        }
    }
}

impl Drop for CbPeripheralManager {
    fn drop(&mut self) {
        unsafe {
            let _: () = msg_send![self.manager, stopAdvertising];
            let _: () = msg_send![self.manager, setDelegate: nil];
            (*self.delegate).set_ivar(SINK_IVAR, std::ptr::null_mut::<c_void>());
            self.characteristics.lock().clear();
            let _: () = msg_send![self.manager, release];
            let _: () = msg_send![self.delegate, release];
            drop(Box::from_raw(self.sink));
        }
        debug!("CBPeripheralManager released");
    }
}
