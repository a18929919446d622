//! Test utilities for the ODrive USB workspace
//!
//! Provides an in-memory ODrive ([`SimulatedOdrive`]) that speaks the framed
//! protocol, and a [`SimulatedBus`] that implements [`UsbBackend`] over a list
//! of plugged simulators.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{SimulatedBus, SimulatedOdrive};
//! use common::usb_types::{ODRIVE_PRODUCT_ID, ODRIVE_VENDOR_ID};
//! use common::UsbBackend;
//!
//! let mut bus = SimulatedBus::new();
//! let key = bus.plug(&SimulatedOdrive::new());
//! let found = bus.enumerate(ODRIVE_VENDOR_ID, ODRIVE_PRODUCT_ID).unwrap();
//! assert_eq!(found.len(), 1);
//! assert_eq!(found[0].key, key);
//! ```

use crate::usb_types::{
    BulkTransport, DeviceCandidate, DeviceKey, ODRIVE_PRODUCT_ID, ODRIVE_VENDOR_ID,
    TransportError, UsbBackend,
};
use protocol::codec::{SCHEMA_ENDPOINT_ID, SEQUENCE_MASK, trailer_for};
use protocol::{EndpointValue, RequestFrame, ResponseFrame, Schema};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Serial number reported by a default simulator
pub const DEFAULT_SERIAL_NUMBER: u64 = 0x2061_3939_4D4B;

/// Schema served by a default simulator
pub const DEFAULT_SCHEMA: &str = r#"[
{"name":"","id":0,"type":"json","access":"r"},
{"name":"vbus_voltage","id":1,"type":"float","access":"r"},
{"name":"serial_number","id":2,"type":"uint64","access":"r"},
{"name":"hw_version_major","id":3,"type":"uint8","access":"r"},
{"name":"axis0","type":"object","members":[
{"name":"error","id":4,"type":"int32","access":"rw"},
{"name":"current_state","id":5,"type":"uint8","access":"r"},
{"name":"requested_state","id":6,"type":"uint8","access":"rw"},
{"name":"motor","type":"object","members":[{"name":"error","id":7,"type":"int32","access":"rw"}]},
{"name":"encoder","type":"object","members":[{"name":"error","id":8,"type":"int32","access":"rw"}]},
{"name":"controller","type":"object","members":[
{"name":"error","id":9,"type":"int32","access":"rw"},
{"name":"input_pos","id":10,"type":"float","access":"rw"},
{"name":"move_incremental","id":11,"type":"function","inputs":[
{"name":"displacement","id":12,"type":"float","access":"rw"},
{"name":"from_input_pos","id":13,"type":"bool","access":"rw"}],"outputs":[]}]}]},
{"name":"test_function","id":14,"type":"function",
"inputs":[{"name":"delta","id":15,"type":"int32","access":"rw"}],
"outputs":[{"name":"result","id":16,"type":"int32","access":"rw"}]},
{"name":"save_configuration","id":17,"type":"function","inputs":[],"outputs":[]}
]"#;

/// Device-side behaviour of a function endpoint
///
/// Receives every current value keyed by identifier and returns the values to
/// overwrite.
pub type CallHandler =
    Arc<dyn Fn(&HashMap<String, EndpointValue>) -> Vec<(String, EndpointValue)> + Send + Sync>;

struct DeviceState {
    schema_text: Vec<u8>,
    schema: Option<Schema>,
    values: HashMap<u16, EndpointValue>,
    handlers: HashMap<u16, CallHandler>,
    calls: HashMap<u16, usize>,
    requests: Vec<RequestFrame>,
    responses: VecDeque<Vec<u8>>,
    stale_responses: usize,
    zero_length_reads: usize,
    failing_writes: usize,
    unresponsive: bool,
    unplugged: bool,
    open: bool,
    open_count: usize,
}

/// In-memory ODrive speaking the framed bulk protocol
///
/// Cloning yields another handle to the same device, so a test can keep one
/// handle for assertions while the code under test owns the transport.
#[derive(Clone)]
pub struct SimulatedOdrive {
    state: Arc<Mutex<DeviceState>>,
}

impl fmt::Debug for SimulatedOdrive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("SimulatedOdrive")
            .field("schema_len", &state.schema_text.len())
            .field("open", &state.open)
            .field("unplugged", &state.unplugged)
            .finish()
    }
}

impl Default for SimulatedOdrive {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedOdrive {
    /// Device serving [`DEFAULT_SCHEMA`] with [`DEFAULT_SERIAL_NUMBER`]
    pub fn new() -> Self {
        Self::with_schema(DEFAULT_SCHEMA).with_serial_number(DEFAULT_SERIAL_NUMBER)
    }

    /// Device serving arbitrary schema text
    ///
    /// Text that does not parse is still served, but the device then answers
    /// no value reads.
    pub fn with_schema(schema_text: &str) -> Self {
        let schema = Schema::parse(schema_text, 0).ok();
        let values = schema
            .iter()
            .flat_map(|schema| schema.scalars())
            .filter_map(|info| Some((info.id, EndpointValue::zero(info.value_type?))))
            .collect();

        Self {
            state: Arc::new(Mutex::new(DeviceState {
                schema_text: schema_text.as_bytes().to_vec(),
                schema,
                values,
                handlers: HashMap::new(),
                calls: HashMap::new(),
                requests: Vec::new(),
                responses: VecDeque::new(),
                stale_responses: 0,
                zero_length_reads: 0,
                failing_writes: 0,
                unresponsive: false,
                unplugged: false,
                open: false,
                open_count: 0,
            })),
        }
    }

    /// Set the value reported by `serial_number`
    pub fn with_serial_number(self, serial_number: u64) -> Self {
        self.set_value("serial_number", EndpointValue::new(serial_number));
        self
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schema CRC the device validates request trailers against
    pub fn schema_crc(&self) -> u16 {
        protocol::crc16_json(&self.lock().schema_text)
    }

    /// Current value of an endpoint, `None` for unknown identifiers
    pub fn value(&self, identifier: &str) -> Option<EndpointValue> {
        let state = self.lock();
        let id = state.schema.as_ref()?.resolve(identifier)?.id;
        state.values.get(&id).copied()
    }

    /// Overwrite an endpoint value from the device side
    ///
    /// Returns false if the identifier is unknown or the type doesn't match.
    pub fn set_value(&self, identifier: &str, value: EndpointValue) -> bool {
        let mut state = self.lock();
        let Some(info) = state
            .schema
            .as_ref()
            .and_then(|schema| schema.resolve(identifier))
        else {
            return false;
        };
        if info.value_type != value.value_type() {
            return false;
        }
        let id = info.id;
        state.values.insert(id, value);
        true
    }

    /// Install device-side behaviour for a function endpoint
    pub fn on_call(&self, identifier: &str, handler: CallHandler) -> bool {
        let mut state = self.lock();
        let Some(id) = state
            .schema
            .as_ref()
            .and_then(|schema| schema.resolve(identifier))
            .filter(|info| info.is_function())
            .map(|info| info.id)
        else {
            return false;
        };
        state.handlers.insert(id, handler);
        true
    }

    /// Number of times a function endpoint was triggered
    pub fn call_count(&self, identifier: &str) -> usize {
        let state = self.lock();
        state
            .schema
            .as_ref()
            .and_then(|schema| schema.resolve(identifier))
            .and_then(|info| state.calls.get(&info.id).copied())
            .unwrap_or(0)
    }

    /// Every frame received so far, in order
    pub fn requests(&self) -> Vec<RequestFrame> {
        self.lock().requests.clone()
    }

    /// Frames received that were not schema reads
    pub fn value_requests(&self) -> Vec<RequestFrame> {
        self.lock()
            .requests
            .iter()
            .filter(|frame| frame.endpoint_id != SCHEMA_ENDPOINT_ID)
            .cloned()
            .collect()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    /// Answer each of the next `count` reads with a mismatched sequence first
    pub fn inject_stale_responses(&self, count: usize) {
        self.lock().stale_responses = count;
    }

    /// Make the next `count` bulk reads return zero bytes
    pub fn inject_zero_length_reads(&self, count: usize) {
        self.lock().zero_length_reads = count;
    }

    /// Make the next `count` bulk writes stall with a timeout
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().failing_writes = count;
    }

    /// Swallow requests without answering; reads then time out
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.lock().unresponsive = unresponsive;
    }

    /// Queue raw bytes as the next bulk-in transfer
    pub fn queue_raw_response(&self, bytes: Vec<u8>) {
        self.lock().responses.push_back(bytes);
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// How many times the device has been opened
    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    fn set_unplugged(&self, unplugged: bool) {
        let mut state = self.lock();
        state.unplugged = unplugged;
        if unplugged {
            state.open = false;
            state.responses.clear();
        }
    }

    /// Open the device and hand out its transport
    pub fn transport(&self) -> Box<dyn BulkTransport> {
        let mut state = self.lock();
        state.open = true;
        state.open_count += 1;
        Box::new(SimulatedTransport {
            device: self.clone(),
            closed: false,
        })
    }

    fn handle_request(&self, bytes: &[u8]) {
        let mut state = self.lock();
        let Ok(frame) = RequestFrame::decode(bytes) else {
            return;
        };
        state.requests.push(frame.clone());

        if state.unresponsive {
            return;
        }
        let schema_crc = protocol::crc16_json(&state.schema_text);
        if frame.trailer != trailer_for(frame.endpoint_id, schema_crc) {
            return;
        }

        if frame.read {
            let body = state.read_body(&frame);
            if state.stale_responses > 0 {
                state.stale_responses -= 1;
                let stale = ResponseFrame {
                    sequence: (frame.sequence.wrapping_add(0x800) & SEQUENCE_MASK) | 0x8000,
                    body: body.clone(),
                };
                state.responses.push_back(stale.encode());
            }
            let response = ResponseFrame {
                sequence: frame.sequence | 0x8000,
                body,
            };
            state.responses.push_back(response.encode());
        } else {
            state.write(&frame);
        }
    }
}

impl DeviceState {
    fn read_body(&self, frame: &RequestFrame) -> Vec<u8> {
        if frame.endpoint_id == SCHEMA_ENDPOINT_ID {
            let Ok(offset) = <[u8; 4]>::try_from(frame.payload.as_slice()) else {
                return Vec::new();
            };
            let start = (u32::from_le_bytes(offset) as usize).min(self.schema_text.len());
            let end = (start + frame.expected_len as usize).min(self.schema_text.len());
            return self.schema_text[start..end].to_vec();
        }
        self.values
            .get(&frame.endpoint_id)
            .map(|value| value.to_bytes().to_vec())
            .unwrap_or_default()
    }

    fn write(&mut self, frame: &RequestFrame) {
        let Some(info) = self
            .schema
            .as_ref()
            .and_then(|schema| schema.table().values().find(|i| i.id == frame.endpoint_id))
            .cloned()
        else {
            return;
        };

        match info.value_type {
            None if info.is_function() => {
                *self.calls.entry(info.id).or_insert(0) += 1;
                if let Some(handler) = self.handlers.get(&info.id).cloned() {
                    let snapshot = self.snapshot();
                    for (identifier, value) in handler(&snapshot) {
                        self.store(&identifier, value);
                    }
                }
            }
            None => {}
            Some(_) if info.read_only => {}
            Some(value_type) => {
                if let Ok(value) = EndpointValue::from_bytes(value_type, &frame.payload) {
                    self.values.insert(info.id, value);
                }
            }
        }
    }

    fn snapshot(&self) -> HashMap<String, EndpointValue> {
        let Some(schema) = self.schema.as_ref() else {
            return HashMap::new();
        };
        schema
            .scalars()
            .filter_map(|info| Some((info.identifier.clone(), *self.values.get(&info.id)?)))
            .collect()
    }

    fn store(&mut self, identifier: &str, value: EndpointValue) {
        let Some(id) = self
            .schema
            .as_ref()
            .and_then(|schema| schema.resolve(identifier))
            .map(|info| info.id)
        else {
            return;
        };
        self.values.insert(id, value);
    }
}

struct SimulatedTransport {
    device: SimulatedOdrive,
    closed: bool,
}

impl BulkTransport for SimulatedTransport {
    fn bulk_write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        {
            let mut state = self.device.lock();
            if self.closed || state.unplugged {
                return Err(TransportError::Disconnected);
            }
            if state.failing_writes > 0 {
                state.failing_writes -= 1;
                return Err(TransportError::Timeout);
            }
        }
        self.device.handle_request(data);
        Ok(data.len())
    }

    fn bulk_read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut state = self.device.lock();
        if self.closed || state.unplugged {
            return Err(TransportError::Disconnected);
        }
        if state.zero_length_reads > 0 {
            state.zero_length_reads -= 1;
            return Ok(Vec::new());
        }
        match state.responses.pop_front() {
            Some(mut bytes) => {
                bytes.truncate(max_len);
                Ok(bytes)
            }
            None => Err(TransportError::Timeout),
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.device.lock().open = false;
        }
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Default)]
struct BusState {
    devices: Vec<(DeviceCandidate, SimulatedOdrive)>,
    next_address: u8,
    open_failures: HashMap<DeviceKey, TransportError>,
    enumerations: usize,
}

/// Simulated USB bus holding plugged [`SimulatedOdrive`]s
#[derive(Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a device under a fresh bus address
    pub fn plug(&self, device: &SimulatedOdrive) -> DeviceKey {
        device.set_unplugged(false);
        let mut state = self.lock();
        state.next_address = state.next_address.wrapping_add(1).max(1);
        let key = DeviceKey::new(1, state.next_address);
        let candidate = DeviceCandidate {
            key,
            vendor_id: ODRIVE_VENDOR_ID,
            product_id: ODRIVE_PRODUCT_ID,
            description: "ODrive 3.6 CDC Interface".to_string(),
        };
        state.devices.push((candidate, device.clone()));
        key
    }

    /// Detach a device; its open transports start failing as disconnected
    pub fn unplug(&self, key: DeviceKey) -> Option<SimulatedOdrive> {
        let mut state = self.lock();
        let index = state.devices.iter().position(|(c, _)| c.key == key)?;
        let (_, device) = state.devices.remove(index);
        device.set_unplugged(true);
        Some(device)
    }

    /// Make the next open of `key` fail with `error`
    pub fn fail_next_open(&self, key: DeviceKey, error: TransportError) {
        self.lock().open_failures.insert(key, error);
    }

    /// Keys of all attached devices
    pub fn keys(&self) -> Vec<DeviceKey> {
        self.lock().devices.iter().map(|(c, _)| c.key).collect()
    }

    /// Number of enumerate calls so far
    pub fn enumeration_count(&self) -> usize {
        self.lock().enumerations
    }
}

impl UsbBackend for SimulatedBus {
    fn enumerate(
        &mut self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Vec<DeviceCandidate>, TransportError> {
        let mut state = self.lock();
        state.enumerations += 1;
        Ok(state
            .devices
            .iter()
            .map(|(candidate, _)| candidate)
            .filter(|c| c.vendor_id == vendor_id && c.product_id == product_id)
            .cloned()
            .collect())
    }

    fn open(
        &mut self,
        candidate: &DeviceCandidate,
    ) -> Result<Box<dyn BulkTransport>, TransportError> {
        let mut state = self.lock();
        if let Some(error) = state.open_failures.remove(&candidate.key) {
            return Err(error);
        }
        let device = state
            .devices
            .iter()
            .find(|(c, _)| c.key == candidate.key)
            .map(|(_, device)| device.clone())
            .ok_or(TransportError::NotFound)?;
        drop(state);

        if device.is_open() {
            return Err(TransportError::AlreadyOpen);
        }
        Ok(device.transport())
    }
}

/// Timeout wrapper for async tests
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
