//! Per-device protocol engine
//!
//! A [`Session`] owns one opened device. It fetches and caches the endpoint
//! schema, then offers typed read/write/execute against it.
//!
//! # Lifecycle
//!
//! ```text
//! Unopened -> Opening -> SchemaLoading -> Ready
//!                 \            \           |
//!                  +------------+----------+--> Disconnected (terminal)
//! ```
//!
//! Only `Ready` accepts value operations. Any transport failure, correlation
//! timeout or schema failure releases the USB handle and moves the session to
//! `Disconnected`; reconnecting is the registry's job and produces a new
//! session.
//!
//! # Concurrency
//!
//! Every transfer-issuing operation holds the session's link lock for its
//! whole request/response exchange, so two callers never interleave frames
//! on the wire. Lock order is link, then schema.

use crate::config::ProtocolSettings;
use crate::error::{BackendError, Result};
use common::{BulkTransport, DeviceCandidate, DeviceIdentity, DeviceKey, UsbBackend};
use protocol::codec::{RESPONSE_PREFIX_LEN, trailer_for};
use protocol::{
    EndpointInfo, EndpointKind, EndpointValue, PROTOCOL_VERSION, RequestFrame, ResponseFrame,
    SCHEMA_ENDPOINT_ID, Scalar, Schema, SequenceCounter, ValueType, schema_offset_payload,
};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Identifier of the endpoint holding the board's serial number
const SERIAL_NUMBER_ENDPOINT: &str = "serial_number";

/// Endpoints feeding [`DeviceStatus`]
const AXIS_ERROR_ENDPOINT: &str = "axis0.error";
const MOTOR_ERROR_ENDPOINT: &str = "axis0.motor.error";
const ENCODER_ERROR_ENDPOINT: &str = "axis0.encoder.error";
const CONTROLLER_ERROR_ENDPOINT: &str = "axis0.controller.error";

/// Payload of the frame that triggers a function
const EXECUTE_PAYLOAD: [u8; 1] = [0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Unopened,
    Opening,
    SchemaLoading,
    Ready,
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unopened => "unopened",
            SessionState::Opening => "opening",
            SessionState::SchemaLoading => "schema loading",
            SessionState::Ready => "ready",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Connection flag and last-known error bitfields of a board
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub connected: bool,
    pub axis_error: i32,
    pub motor_error: i32,
    pub encoder_error: i32,
    pub controller_error: i32,
}

impl DeviceStatus {
    /// Whether any error bit is set
    pub fn has_errors(&self) -> bool {
        self.axis_error != 0
            || self.motor_error != 0
            || self.encoder_error != 0
            || self.controller_error != 0
    }
}

/// Everything guarded by the transfer lock
struct Link {
    transport: Option<Box<dyn BulkTransport>>,
    sequence: SequenceCounter,
    state: SessionState,
}

impl Link {
    fn transport(&mut self) -> Result<&mut Box<dyn BulkTransport>> {
        self.transport
            .as_mut()
            .ok_or(BackendError::TransportDisconnected)
    }

    fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.state = SessionState::Disconnected;
    }
}

/// How a response body is accepted by [`Session::transact`]
#[derive(Debug, Clone, Copy)]
enum BodyLen {
    /// Typed values: exactly the width of the type
    Exact(usize),
    /// Schema chunks: anything up to the requested size, empty included
    UpTo(usize),
}

impl BodyLen {
    fn max(self) -> usize {
        match self {
            BodyLen::Exact(len) | BodyLen::UpTo(len) => len,
        }
    }

    fn accepts(self, len: usize) -> bool {
        match self {
            BodyLen::Exact(expected) => len == expected,
            BodyLen::UpTo(max) => len <= max,
        }
    }
}

/// Protocol engine for one physical board
pub struct Session {
    candidate: DeviceCandidate,
    config: ProtocolSettings,
    link: Mutex<Link>,
    schema: RwLock<Option<Arc<Schema>>>,
    identity: RwLock<Option<DeviceIdentity>>,
    slot: AtomicUsize,
    status: Mutex<DeviceStatus>,
    loss_reported: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.candidate.key)
            .field("slot", &self.slot())
            .field("state", &self.state())
            .field("serial_number", &self.serial_number())
            .finish()
    }
}

impl Session {
    /// Session for `candidate`, not yet opened
    pub fn new(candidate: DeviceCandidate, config: ProtocolSettings) -> Self {
        Self::build(candidate, config, None, SessionState::Unopened)
    }

    /// Session over an already opened transport, ready for [`load`](Self::load)
    pub fn with_transport(
        candidate: DeviceCandidate,
        transport: Box<dyn BulkTransport>,
        config: ProtocolSettings,
    ) -> Self {
        Self::build(candidate, config, Some(transport), SessionState::SchemaLoading)
    }

    fn build(
        candidate: DeviceCandidate,
        config: ProtocolSettings,
        transport: Option<Box<dyn BulkTransport>>,
        state: SessionState,
    ) -> Self {
        Self {
            candidate,
            config,
            link: Mutex::new(Link {
                transport,
                sequence: SequenceCounter::new(),
                state,
            }),
            schema: RwLock::new(None),
            identity: RwLock::new(None),
            slot: AtomicUsize::new(0),
            status: Mutex::new(DeviceStatus::default()),
            loss_reported: AtomicBool::new(false),
        }
    }

    /// Open, claim and fully load a device
    pub fn connect(
        backend: &mut dyn UsbBackend,
        candidate: DeviceCandidate,
        config: ProtocolSettings,
    ) -> Result<Self> {
        let session = Self::new(candidate, config);
        session.open(backend)?;
        session.load()?;
        Ok(session)
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_status(&self) -> MutexGuard<'_, DeviceStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the device through `backend` and claim its interface
    pub fn open(&self, backend: &mut dyn UsbBackend) -> Result<()> {
        let mut link = self.lock_link();
        if link.state != SessionState::Unopened {
            return Err(BackendError::NotReady(link.state));
        }
        link.state = SessionState::Opening;

        match backend.open(&self.candidate) {
            Ok(transport) => {
                debug!("Opened {}", self.candidate.key);
                link.transport = Some(transport);
                link.state = SessionState::SchemaLoading;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to open {}: {}", self.candidate.key, e);
                link.state = SessionState::Disconnected;
                Err(BackendError::Open(e))
            }
        }
    }

    /// Fetch the schema, parse it and read the serial number
    ///
    /// A board without a usable serial number still loads, but has no
    /// identity and is refused a registry slot. On any failure the handle is
    /// released and the session is left disconnected with no schema exposed.
    pub fn load(&self) -> Result<()> {
        let mut link = self.lock_link();
        if link.state != SessionState::SchemaLoading {
            return Err(BackendError::NotReady(link.state));
        }

        match self.load_locked(&mut link) {
            Ok((schema, serial_number)) => {
                info!(
                    "Loaded schema for {} ({} endpoints, crc {:#06x})",
                    self.candidate.key,
                    schema.len(),
                    schema.crc()
                );
                let identity = serial_number.map(|serial| DeviceIdentity::new(&self.candidate, serial));
                *self.schema.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(schema));
                *self.identity.write().unwrap_or_else(PoisonError::into_inner) = identity;
                self.lock_status().connected = true;
                link.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to load {}: {}", self.candidate.key, e);
                link.close();
                Err(e)
            }
        }
    }

    fn load_locked(&self, link: &mut Link) -> Result<(Schema, Option<u64>)> {
        let text = self.fetch_schema_text(link)?;
        let schema = Schema::parse(&text, self.slot())?;

        let Some(info) = schema
            .resolve(SERIAL_NUMBER_ENDPOINT)
            .filter(|info| info.value_type == Some(ValueType::Uint64))
        else {
            warn!("{} has no uint64 serial_number endpoint", self.candidate.key);
            return Ok((schema, None));
        };
        let body = self.transact(
            link,
            info.id,
            Vec::new(),
            schema.crc(),
            BodyLen::Exact(ValueType::Uint64.size()),
        )?;
        let serial_number = u64::from_le_slice(&body)?;
        if serial_number == 0 {
            warn!("{} reports serial number 0", self.candidate.key);
            return Ok((schema, None));
        }

        Ok((schema, Some(serial_number)))
    }

    /// Page the schema text out of endpoint 0 until an empty chunk arrives
    fn fetch_schema_text(&self, link: &mut Link) -> Result<String> {
        let chunk_size = self.config.schema_chunk_size;
        let mut text = Vec::new();

        loop {
            if text.len() > self.config.max_schema_len {
                return Err(BackendError::MalformedSchema(format!(
                    "schema exceeds {} bytes",
                    self.config.max_schema_len
                )));
            }
            let offset = u32::try_from(text.len()).map_err(|_| {
                BackendError::MalformedSchema("schema offset overflow".to_string())
            })?;

            let chunk = self.fetch_schema_chunk(link, offset, chunk_size)?;
            if chunk.is_empty() {
                break;
            }
            trace!("Schema chunk at offset {}: {} bytes", offset, chunk.len());
            text.extend_from_slice(&chunk);
        }

        debug!("Fetched {} bytes of schema", text.len());
        String::from_utf8(text)
            .map_err(|_| BackendError::MalformedSchema("schema is not valid UTF-8".to_string()))
    }

    fn fetch_schema_chunk(&self, link: &mut Link, offset: u32, chunk_size: u16) -> Result<Vec<u8>> {
        let attempts = self.config.schema_chunk_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = self.transact(
                link,
                SCHEMA_ENDPOINT_ID,
                schema_offset_payload(offset),
                PROTOCOL_VERSION,
                BodyLen::UpTo(usize::from(chunk_size)),
            );
            match result {
                Err(BackendError::TransportTimeout) if attempt < attempts => {
                    debug!(
                        "Schema chunk at offset {} timed out (attempt {}/{})",
                        offset, attempt, attempts
                    );
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Send a read request and wait for its response
    ///
    /// Frames with a foreign sequence number or an unacceptable length are
    /// discarded. The wait is bounded both by the read timeout and by the
    /// number of discarded frames. A zero-length transfer means the device is
    /// gone.
    fn transact(
        &self,
        link: &mut Link,
        endpoint_id: u16,
        payload: Vec<u8>,
        trailer: u16,
        body_len: BodyLen,
    ) -> Result<Vec<u8>> {
        let expected_len = u16::try_from(body_len.max()).map_err(|_| BackendError::TypeMismatch {
            expected: "at most 65535 bytes".to_string(),
            found: format!("{} bytes", body_len.max()),
        })?;
        let sequence = self.send_read(link, endpoint_id, expected_len, payload, trailer)?;

        let deadline = Instant::now() + self.config.read_timeout();
        let mut discarded = 0u32;

        loop {
            if Instant::now() >= deadline {
                debug!(
                    "No response to sequence {} on endpoint {} within {:?}",
                    sequence,
                    endpoint_id,
                    self.config.read_timeout()
                );
                return Err(BackendError::TransportTimeout);
            }

            match self.receive(link, body_len.max()) {
                Ok(response) if response.matches(sequence) && body_len.accepts(response.body.len()) => {
                    return Ok(response.body);
                }
                Ok(response) => trace!(
                    "Discarding response seq {:#06x} ({} bytes) while waiting for {:#06x}",
                    response.sequence,
                    response.body.len(),
                    sequence
                ),
                Err(BackendError::Protocol(e)) => trace!("Discarding runt frame: {}", e),
                Err(e) => return Err(e),
            }

            discarded += 1;
            if discarded > self.config.max_discarded_frames {
                warn!(
                    "Gave up on sequence {} after discarding {} frames",
                    sequence, discarded
                );
                return Err(BackendError::TransportTimeout);
            }
        }
    }

    /// Bulk-out with bounded retries for transient stalls
    fn send(&self, link: &mut Link, frame: &RequestFrame) -> Result<()> {
        let bytes = frame.encode()?;
        let attempts = self.config.write_attempts.max(1);
        let transport = link.transport()?;

        for attempt in 1..=attempts {
            match transport.bulk_write(&bytes) {
                Ok(written) if written == bytes.len() => return Ok(()),
                Ok(written) => debug!(
                    "Short write ({} of {} bytes), attempt {}/{}",
                    written,
                    bytes.len(),
                    attempt,
                    attempts
                ),
                Err(e) if e.is_disconnect() => return Err(e.into()),
                Err(e) => debug!("Bulk write failed: {} (attempt {}/{})", e, attempt, attempts),
            }
        }

        warn!(
            "Bulk write to {} failed {} times, dropping link",
            self.candidate.key, attempts
        );
        Err(BackendError::TransportDisconnected)
    }

    /// Frame a read request under the next sequence number and send it
    fn send_read(
        &self,
        link: &mut Link,
        endpoint_id: u16,
        expected_len: u16,
        payload: Vec<u8>,
        trailer: u16,
    ) -> Result<u16> {
        let sequence = link.sequence.advance();
        let frame = RequestFrame::read(sequence, endpoint_id, expected_len, payload, trailer);
        self.send(link, &frame)?;
        Ok(sequence)
    }

    fn send_write(&self, link: &mut Link, endpoint_id: u16, payload: Vec<u8>, crc: u16) -> Result<u16> {
        let sequence = link.sequence.advance();
        let frame = RequestFrame::write(sequence, endpoint_id, payload, trailer_for(endpoint_id, crc));
        self.send(link, &frame)?;
        Ok(sequence)
    }

    /// One bulk-in transfer sized for a body of at most `expected_len` bytes
    ///
    /// A zero-byte transfer means the device is gone. Runt frames come back
    /// as `BackendError::Protocol`.
    fn receive(&self, link: &mut Link, expected_len: usize) -> Result<ResponseFrame> {
        let bytes = link.transport()?.bulk_read(expected_len + RESPONSE_PREFIX_LEN)?;
        if bytes.is_empty() {
            warn!("Zero-length read from {}", self.candidate.key);
            return Err(BackendError::TransportDisconnected);
        }
        Ok(ResponseFrame::decode(&bytes)?)
    }

    /// Lock the link, refusing unless the session is ready
    fn ready_link(&self) -> Result<(MutexGuard<'_, Link>, Arc<Schema>)> {
        let link = self.lock_link();
        if link.state != SessionState::Ready {
            return Err(BackendError::NotReady(link.state));
        }
        let schema = self.schema().ok_or(BackendError::NotReady(link.state))?;
        Ok((link, schema))
    }

    /// Flip to disconnected on link failures, pass everything through
    fn settle<T>(&self, link: &mut Link, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_link_failure() && link.state != SessionState::Disconnected {
                warn!("Lost connection to {}: {}", self.candidate.key, e);
                link.close();
                self.lock_status().connected = false;
            }
        }
        result
    }

    fn resolve(schema: &Schema, identifier: &str) -> Result<EndpointInfo> {
        schema
            .resolve(identifier)
            .cloned()
            .ok_or_else(|| BackendError::UnknownEndpoint(identifier.to_string()))
    }

    fn scalar_type(info: &EndpointInfo) -> Result<ValueType> {
        info.value_type.ok_or_else(|| BackendError::TypeMismatch {
            expected: info.type_name.clone(),
            found: "value access".to_string(),
        })
    }

    fn read_locked(&self, link: &mut Link, schema: &Schema, info: &EndpointInfo) -> Result<EndpointValue> {
        let value_type = Self::scalar_type(info)?;
        let result = self.transact(
            link,
            info.id,
            Vec::new(),
            schema.crc(),
            BodyLen::Exact(value_type.size()),
        );
        let body = self.settle(link, result)?;
        Ok(EndpointValue::from_bytes(value_type, &body)?)
    }

    fn write_locked(
        &self,
        link: &mut Link,
        schema: &Schema,
        info: &EndpointInfo,
        value: &EndpointValue,
    ) -> Result<()> {
        let value_type = Self::scalar_type(info)?;
        if info.read_only {
            return Err(BackendError::ReadOnly(info.identifier.clone()));
        }
        if value.value_type() != Some(value_type) {
            return Err(BackendError::TypeMismatch {
                expected: value_type.to_string(),
                found: value
                    .value_type()
                    .map_or_else(|| "invalid".to_string(), |t| t.to_string()),
            });
        }
        let result = self
            .send_write(link, info.id, value.to_bytes().to_vec(), schema.crc())
            .map(|_| ());
        self.settle(link, result)
    }

    fn trigger_locked(&self, link: &mut Link, schema: &Schema, info: &EndpointInfo) -> Result<()> {
        if !info.is_function() {
            return Err(BackendError::NotAFunction(info.identifier.clone()));
        }
        let result = self
            .send_write(link, info.id, EXECUTE_PAYLOAD.to_vec(), schema.crc())
            .map(|_| ());
        self.settle(link, result)
    }

    /// Typed read; `T` must match the endpoint's declared type
    pub fn read<T: Scalar>(&self, identifier: &str) -> Result<T> {
        let (mut link, schema) = self.ready_link()?;
        let info = Self::resolve(&schema, identifier)?;
        let value_type = Self::scalar_type(&info)?;
        if value_type != T::VALUE_TYPE {
            return Err(BackendError::TypeMismatch {
                expected: value_type.to_string(),
                found: T::VALUE_TYPE.to_string(),
            });
        }
        let value = self.read_locked(&mut link, &schema, &info)?;
        Ok(value.get::<T>()?)
    }

    /// Read using the endpoint's declared type
    pub fn read_value(&self, identifier: &str) -> Result<EndpointValue> {
        let (mut link, schema) = self.ready_link()?;
        let info = Self::resolve(&schema, identifier)?;
        self.read_locked(&mut link, &schema, &info)
    }

    /// Typed write, fire-and-forget
    ///
    /// Read-only endpoints are rejected before anything is sent.
    pub fn write<T: Scalar>(&self, identifier: &str, value: T) -> Result<()> {
        self.write_value(identifier, EndpointValue::new(value))
    }

    /// Write a tagged value; the tag must match the declared type
    pub fn write_value(&self, identifier: &str, value: EndpointValue) -> Result<()> {
        let (mut link, schema) = self.ready_link()?;
        let info = Self::resolve(&schema, identifier)?;
        self.write_locked(&mut link, &schema, &info, &value)
    }

    /// Trigger a function endpoint
    pub fn execute(&self, identifier: &str) -> Result<()> {
        let (mut link, schema) = self.ready_link()?;
        let info = Self::resolve(&schema, identifier)?;
        self.trigger_locked(&mut link, &schema, &info)
    }

    /// Write every input, trigger the function, read back every output
    ///
    /// Runs under a single lock hold, so no other operation on this device
    /// lands between the steps.
    pub fn call(&self, identifier: &str, inputs: &[EndpointValue]) -> Result<Vec<EndpointValue>> {
        let (mut link, schema) = self.ready_link()?;
        let info = Self::resolve(&schema, identifier)?;
        let Some(EndpointKind::Function {
            inputs: declared_inputs,
            outputs: declared_outputs,
            ..
        }) = schema.find(identifier).map(|node| &node.kind)
        else {
            return Err(BackendError::NotAFunction(identifier.to_string()));
        };

        if inputs.len() != declared_inputs.len() {
            return Err(BackendError::TypeMismatch {
                expected: format!("{} arguments", declared_inputs.len()),
                found: format!("{} arguments", inputs.len()),
            });
        }

        for (argument, value) in declared_inputs.iter().zip(inputs) {
            let argument = Self::resolve(&schema, &argument.identifier)?;
            self.write_locked(&mut link, &schema, &argument, value)?;
        }
        self.trigger_locked(&mut link, &schema, &info)?;

        declared_outputs
            .iter()
            .map(|output| {
                let output = Self::resolve(&schema, &output.identifier)?;
                self.read_locked(&mut link, &schema, &output)
            })
            .collect()
    }

    /// Read the four error bitfields of axis 0
    ///
    /// Endpoints missing from the schema read as zero.
    pub fn refresh_status(&self) -> Result<DeviceStatus> {
        let (mut link, schema) = self.ready_link()?;

        let mut read_error = |identifier: &str| -> Result<i32> {
            let Some(info) = schema.resolve(identifier) else {
                return Ok(0);
            };
            let value = self.read_locked(&mut link, &schema, info)?;
            Ok(value.as_i64().map_or(0, |v| v as i32))
        };

        let status = DeviceStatus {
            connected: true,
            axis_error: read_error(AXIS_ERROR_ENDPOINT)?,
            motor_error: read_error(MOTOR_ERROR_ENDPOINT)?,
            encoder_error: read_error(ENCODER_ERROR_ENDPOINT)?,
            controller_error: read_error(CONTROLLER_ERROR_ENDPOINT)?,
        };
        *self.lock_status() = status;
        Ok(status)
    }

    /// Release the handle and mark the session disconnected. Idempotent.
    pub fn disconnect(&self) {
        let mut link = self.lock_link();
        if link.state != SessionState::Disconnected {
            info!("Disconnecting {}", self.candidate.key);
        }
        link.close();
        self.lock_status().connected = false;
    }

    /// Claim the one report of this session's disconnection
    ///
    /// True for the first caller only.
    pub(crate) fn take_loss_report(&self) -> bool {
        !self.loss_reported.swap(true, Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        self.lock_link().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Bus location this session was opened from
    pub fn key(&self) -> DeviceKey {
        self.candidate.key
    }

    /// Identity, available once loaded
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn serial_number(&self) -> Option<u64> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|identity| identity.serial_number)
    }

    /// Parsed schema, available once loaded
    ///
    /// The returned tree belongs to this session only; after a reconnect,
    /// resolve identifiers against the new session's schema.
    pub fn schema(&self) -> Option<Arc<Schema>> {
        self.schema
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn endpoint_info(&self, identifier: &str) -> Option<EndpointInfo> {
        self.schema()?.resolve(identifier).cloned()
    }

    pub fn slot(&self) -> usize {
        self.slot.load(Ordering::Acquire)
    }

    /// Move the session (and its schema) to another registry slot
    pub fn set_slot(&self, slot: usize) {
        self.slot.store(slot, Ordering::Release);
        let mut schema = self.schema.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = schema.as_ref() {
            if current.slot() != slot {
                *schema = Some(Arc::new(current.with_slot(slot)));
            }
        }
    }

    /// Last-known connection flag and error bitfields
    pub fn status(&self) -> DeviceStatus {
        *self.lock_status()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let link = self.link.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut transport) = link.transport.take() {
            transport.close();
        }
    }
}
