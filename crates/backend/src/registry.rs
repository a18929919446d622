//! Device registry
//!
//! Fixed-capacity table of sessions indexed by slot. A board keeps its slot
//! across unplug/replug because reconnection is matched by serial number,
//! not by bus location.
//!
//! Endpoints are addressed registry-wide as `odrv<slot>.<identifier>`. The
//! registry also keeps the value cache that display front ends poll.
//!
//! Lock order: backend, slots, session link. The cache lock is never held
//! while a session lock is taken.

use crate::config::BackendConfig;
use crate::error::{BackendError, Result};
use crate::session::{DeviceStatus, Session, SessionState};
use crate::usb::HotplugDiff;
use common::{DeviceCandidate, DeviceKey, EventSink, RegistryEvent, UsbBackend};
use protocol::{EndpointInfo, EndpointValue, Scalar, Schema};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Prefix of every registry-wide endpoint path
const PATH_PREFIX: &str = "odrv";

/// Outcome of one [`DeviceRegistry::scan`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Slots that received a session during this pass
    pub connected: Vec<usize>,
    /// Boards that were found but could not be connected
    pub rejected: Vec<DeviceKey>,
    /// Boards that vanished from the bus
    pub departed: Vec<DeviceKey>,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.connected.is_empty() && self.rejected.is_empty() && self.departed.is_empty()
    }
}

/// Split `odrv<slot>.<identifier>` into its parts
pub fn parse_path(path: &str) -> Result<(usize, &str)> {
    let invalid = || BackendError::InvalidPath(path.to_string());

    let rest = path.strip_prefix(PATH_PREFIX).ok_or_else(invalid)?;
    let (slot, identifier) = rest.split_once('.').ok_or_else(invalid)?;
    if slot.is_empty() || !slot.bytes().all(|b| b.is_ascii_digit()) || identifier.is_empty() {
        return Err(invalid());
    }
    let slot = slot.parse().map_err(|_| invalid())?;
    Ok((slot, identifier))
}

fn full_path(slot: usize, identifier: &str) -> String {
    format!("{}{}.{}", PATH_PREFIX, slot, identifier)
}

/// Slot table, hotplug state and value cache over one USB backend
pub struct DeviceRegistry<B: UsbBackend> {
    backend: Mutex<B>,
    config: BackendConfig,
    slots: RwLock<Vec<Option<Arc<Session>>>>,
    hotplug: Mutex<HotplugDiff>,
    cache: RwLock<HashMap<String, EndpointValue>>,
    events: Option<EventSink>,
}

impl<B: UsbBackend> DeviceRegistry<B> {
    /// Registry with `config.registry.max_devices` empty slots
    pub fn new(backend: B, config: BackendConfig) -> Self {
        let capacity = config.registry.max_devices;
        Self {
            backend: Mutex::new(backend),
            config,
            slots: RwLock::new(vec![None; capacity]),
            hotplug: Mutex::new(HotplugDiff::new()),
            cache: RwLock::new(HashMap::new()),
            events: None,
        }
    }

    /// Publish connection changes to `sink`
    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.config.registry.max_devices
    }

    fn lock_backend(&self) -> MutexGuard<'_, B> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_hotplug(&self) -> MutexGuard<'_, HotplugDiff> {
        self.hotplug.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, Vec<Option<Arc<Session>>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, Vec<Option<Arc<Session>>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, HashMap<String, EndpointValue>> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, HashMap<String, EndpointValue>> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: RegistryEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    /// One hotplug pass
    ///
    /// Sessions that lost their link since the last pass are announced and
    /// their boards become eligible for reconnection. Departed boards are
    /// marked disconnected. Each new board is opened, loaded and given a
    /// slot; failures are reported as rejections and not retried until the
    /// board re-enumerates.
    pub fn scan(&self) -> Result<ScanReport> {
        self.sweep_lost_links();

        let usb = &self.config.usb;
        let candidates = self.lock_backend().enumerate(usb.vendor_id, usb.product_id)?;
        let changes = self.lock_hotplug().update(&candidates);

        let mut report = ScanReport::default();
        if changes.is_empty() {
            return Ok(report);
        }

        for key in changes.departed {
            self.handle_departure(key);
            report.departed.push(key);
        }

        for candidate in changes.arrived {
            match self.connect(&candidate) {
                Ok(slot) => report.connected.push(slot),
                Err(e) => {
                    warn!("Rejected {} ({}): {}", candidate.description, candidate.key, e);
                    self.publish(RegistryEvent::Rejected {
                        key: candidate.key,
                        reason: e.to_string(),
                    });
                    report.rejected.push(candidate.key);
                }
            }
        }

        Ok(report)
    }

    /// Announce sessions that failed mid-transfer and forget their bus keys
    ///
    /// Each lost session is swept once. If its board then fails to
    /// reconnect, the key stays known and the board is only retried after it
    /// re-enumerates.
    fn sweep_lost_links(&self) {
        let lost: Vec<(usize, Arc<Session>)> = self
            .read_slots()
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| Some((slot, s.clone()?)))
            .filter(|(_, s)| s.state() == SessionState::Disconnected)
            .filter(|(_, s)| s.take_loss_report())
            .collect();
        if lost.is_empty() {
            return;
        }

        let mut hotplug = self.lock_hotplug();
        for (slot, session) in lost {
            if hotplug.forget(session.key()) {
                debug!("Session in slot {} lost its link, retrying {}", slot, session.key());
            }
            if let Some(serial_number) = session.serial_number() {
                self.publish(RegistryEvent::Disconnected { slot, serial_number });
            }
        }
    }

    fn handle_departure(&self, key: DeviceKey) {
        let matching: Vec<(usize, Arc<Session>)> = self
            .sessions()
            .into_iter()
            .filter(|(_, s)| s.key() == key)
            .collect();
        // A stale disconnected session may share a reused bus key
        let found = matching
            .iter()
            .find(|(_, s)| s.state() != SessionState::Disconnected)
            .or_else(|| matching.first())
            .cloned();

        let Some((slot, session)) = found else {
            debug!("Unclaimed device {} departed", key);
            return;
        };

        info!("Device in slot {} ({}) unplugged", slot, key);
        session.disconnect();
        if !session.take_loss_report() {
            return;
        }
        if let Some(serial_number) = session.serial_number() {
            self.publish(RegistryEvent::Disconnected { slot, serial_number });
        }
    }

    /// Open, load and slot one board
    pub fn connect(&self, candidate: &DeviceCandidate) -> Result<usize> {
        let session = Session::new(candidate.clone(), self.config.protocol.clone());
        {
            let mut backend = self.lock_backend();
            session.open(&mut *backend)?;
        }
        session.load()?;
        self.assign_slot(Arc::new(session))
    }

    /// Place a loaded session
    ///
    /// A session whose serial number already owns a slot replaces the old
    /// one there. Otherwise the first empty slot is taken. With no slot free,
    /// or no serial number to match on, the session is closed and the board
    /// left unclaimed.
    pub fn assign_slot(&self, session: Arc<Session>) -> Result<usize> {
        let Some(identity) = session.identity() else {
            session.disconnect();
            return Err(if session.schema().is_some() {
                BackendError::MissingSerialNumber
            } else {
                BackendError::NotReady(session.state())
            });
        };
        let serial_number = identity.serial_number;

        let mut slots = self.write_slots();
        let existing = slots.iter().position(|s| {
            s.as_ref()
                .is_some_and(|s| s.serial_number() == Some(serial_number))
        });

        if let Some(slot) = existing {
            session.set_slot(slot);
            if let Some(previous) = slots[slot].replace(session) {
                if previous.is_ready() {
                    warn!("Serial {:012X} replaced a live session in slot {}", serial_number, slot);
                }
                previous.disconnect();
            }
            drop(slots);

            info!("Reconnected {} in slot {}", identity, slot);
            self.publish(RegistryEvent::Reconnected { slot, identity });
            return Ok(slot);
        }

        if let Some(slot) = slots.iter().position(Option::is_none) {
            session.set_slot(slot);
            slots[slot] = Some(session);
            drop(slots);

            info!("Connected {} in slot {}", identity, slot);
            self.publish(RegistryEvent::Connected { slot, identity });
            return Ok(slot);
        }

        drop(slots);
        warn!(
            "No free slot for {} (capacity {}), releasing it",
            identity,
            self.capacity()
        );
        session.disconnect();
        Err(BackendError::NoFreeSlot { serial_number })
    }

    /// Session occupying `slot`
    ///
    /// The handle may go stale when the board reconnects; look it up again
    /// instead of keeping it.
    pub fn session(&self, slot: usize) -> Result<Arc<Session>> {
        self.read_slots()
            .get(slot)
            .and_then(|s| s.clone())
            .ok_or(BackendError::SlotEmpty(slot))
    }

    /// Occupied slots with their sessions
    pub fn sessions(&self) -> Vec<(usize, Arc<Session>)> {
        self.read_slots()
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| Some((slot, s.clone()?)))
            .collect()
    }

    /// Close and evict the session in `slot`, dropping its cached values
    pub fn remove(&self, slot: usize) -> Result<Arc<Session>> {
        let session = self
            .write_slots()
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or(BackendError::SlotEmpty(slot))?;

        let was_live = session.state() != SessionState::Disconnected;
        session.disconnect();
        self.prune_cache(slot);
        info!("Removed session from slot {}", slot);

        if was_live {
            if let Some(serial_number) = session.serial_number() {
                self.publish(RegistryEvent::Disconnected { slot, serial_number });
            }
        }
        Ok(session)
    }

    fn session_for_path<'a>(&self, path: &'a str) -> Result<(usize, &'a str, Arc<Session>)> {
        let (slot, identifier) = parse_path(path)?;
        Ok((slot, identifier, self.session(slot)?))
    }

    /// Read through to the device and update the cache
    pub fn read_value(&self, path: &str) -> Result<EndpointValue> {
        let (slot, identifier, session) = self.session_for_path(path)?;
        let value = session.read_value(identifier)?;
        self.write_cache().insert(full_path(slot, identifier), value);
        Ok(value)
    }

    pub fn read<T: Scalar>(&self, path: &str) -> Result<T> {
        let (_, identifier, session) = self.session_for_path(path)?;
        session.read(identifier)
    }

    pub fn write_value(&self, path: &str, value: EndpointValue) -> Result<()> {
        let (_, identifier, session) = self.session_for_path(path)?;
        session.write_value(identifier, value)
    }

    pub fn write<T: Scalar>(&self, path: &str, value: T) -> Result<()> {
        let (_, identifier, session) = self.session_for_path(path)?;
        session.write(identifier, value)
    }

    pub fn execute(&self, path: &str) -> Result<()> {
        let (_, identifier, session) = self.session_for_path(path)?;
        session.execute(identifier)
    }

    pub fn call(&self, path: &str, inputs: &[EndpointValue]) -> Result<Vec<EndpointValue>> {
        let (_, identifier, session) = self.session_for_path(path)?;
        session.call(identifier, inputs)
    }

    /// Metadata of the endpoint behind `path`
    pub fn endpoint_info(&self, path: &str) -> Result<EndpointInfo> {
        let (_, identifier, session) = self.session_for_path(path)?;
        let schema = session
            .schema()
            .ok_or_else(|| BackendError::NotReady(session.state()))?;
        schema
            .resolve(identifier)
            .cloned()
            .ok_or_else(|| BackendError::UnknownEndpoint(identifier.to_string()))
    }

    /// Endpoint tree of the board in `slot`
    pub fn endpoint_tree(&self, slot: usize) -> Result<Arc<Schema>> {
        let session = self.session(slot)?;
        session
            .schema()
            .ok_or_else(|| BackendError::NotReady(session.state()))
    }

    /// Last-known status of the board in `slot`
    pub fn status(&self, slot: usize) -> Result<DeviceStatus> {
        Ok(self.session(slot)?.status())
    }

    /// Last-known status of every occupied slot
    pub fn statuses(&self) -> Vec<(usize, DeviceStatus)> {
        self.sessions()
            .into_iter()
            .map(|(slot, session)| (slot, session.status()))
            .collect()
    }

    /// Re-read the status bitfields of every ready board
    pub fn refresh_statuses(&self) -> Vec<(usize, DeviceStatus)> {
        self.sessions()
            .into_iter()
            .filter(|(_, session)| session.is_ready())
            .filter_map(|(slot, session)| match session.refresh_status() {
                Ok(status) => Some((slot, status)),
                Err(e) => {
                    warn!("Status refresh failed for slot {}: {}", slot, e);
                    None
                }
            })
            .collect()
    }

    /// Re-read every scalar of the board in `slot` into the cache
    ///
    /// Endpoints that fail to read while the board stays ready are left out
    /// and logged, and the slot's entries are replaced by what was read.
    /// Returns the number of values stored.
    ///
    /// When the link fails the refresh stops early. Values read so far are
    /// stored, entries for endpoints not reached keep their last value, and
    /// the link error is returned.
    pub fn refresh_value_cache(&self, slot: usize) -> Result<usize> {
        let session = self.session(slot)?;
        let schema = session
            .schema()
            .ok_or_else(|| BackendError::NotReady(session.state()))?;

        let mut fresh = Vec::with_capacity(schema.len());
        let mut aborted = None;
        for info in schema.scalars() {
            match session.read_value(&info.identifier) {
                Ok(value) => fresh.push((full_path(slot, &info.identifier), value)),
                Err(e) if e.is_link_failure() || !session.is_ready() => {
                    warn!("Cache refresh of slot {} aborted: {}", slot, e);
                    aborted = Some(e);
                    break;
                }
                Err(e) => debug!("Skipping {} in cache refresh: {}", info.full_path(), e),
            }
        }

        let stored = fresh.len();
        {
            let mut cache = self.write_cache();
            if aborted.is_none() {
                let prefix = format!("{}{}.", PATH_PREFIX, slot);
                cache.retain(|path, _| !path.starts_with(&prefix));
            }
            cache.extend(fresh);
        }

        if let Some(e) = aborted {
            return Err(e);
        }
        debug!("Refreshed {} cached values for slot {}", stored, slot);
        Ok(stored)
    }

    /// Refresh the cache of every ready board, returning the values stored
    pub fn refresh_all_caches(&self) -> usize {
        self.sessions()
            .into_iter()
            .filter(|(_, session)| session.is_ready())
            .filter_map(|(slot, _)| self.refresh_value_cache(slot).ok())
            .sum()
    }

    /// Last cached value of `path`
    pub fn cached_value(&self, path: &str) -> Option<EndpointValue> {
        let (slot, identifier) = parse_path(path).ok()?;
        self.read_cache().get(&full_path(slot, identifier)).copied()
    }

    /// Copy of the whole cache, ordered by path
    pub fn cache_snapshot(&self) -> BTreeMap<String, EndpointValue> {
        self.read_cache()
            .iter()
            .map(|(path, value)| (path.clone(), *value))
            .collect()
    }

    fn prune_cache(&self, slot: usize) {
        let prefix = format!("{}{}.", PATH_PREFIX, slot);
        self.write_cache().retain(|path, _| !path.starts_with(&prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{SimulatedBus, SimulatedOdrive};

    fn registry(bus: &SimulatedBus) -> DeviceRegistry<SimulatedBus> {
        DeviceRegistry::new(bus.clone(), BackendConfig::default())
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(parse_path("odrv0.vbus_voltage").unwrap(), (0, "vbus_voltage"));
        assert_eq!(
            parse_path("odrv12.axis0.controller.input_pos").unwrap(),
            (12, "axis0.controller.input_pos")
        );

        for bad in ["vbus_voltage", "odrv.x", "odrv0", "odrv0.", "odrvX.y", "odrv+1.y", "odrv-1.y"] {
            assert!(
                matches!(parse_path(bad), Err(BackendError::InvalidPath(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_scan_connects_new_device() {
        let bus = SimulatedBus::new();
        let device = SimulatedOdrive::new();
        let key = bus.plug(&device);

        let registry = registry(&bus);
        let report = registry.scan().unwrap();
        assert_eq!(report.connected, vec![0]);
        assert!(report.rejected.is_empty());

        let session = registry.session(0).unwrap();
        assert_eq!(session.key(), key);
        assert!(session.is_ready());

        // Already known, nothing to do
        assert!(registry.scan().unwrap().is_empty());
    }

    #[test]
    fn test_path_operations() {
        let bus = SimulatedBus::new();
        let device = SimulatedOdrive::new();
        device.set_value("vbus_voltage", EndpointValue::new(23.5f32));
        bus.plug(&device);

        let registry = registry(&bus);
        registry.scan().unwrap();

        assert_eq!(
            registry.read_value("odrv0.vbus_voltage").unwrap(),
            EndpointValue::new(23.5f32)
        );
        assert_eq!(
            registry.cached_value("odrv0.vbus_voltage"),
            Some(EndpointValue::new(23.5f32))
        );

        registry.write("odrv0.axis0.requested_state", 8u8).unwrap();
        assert_eq!(registry.read::<u8>("odrv0.axis0.requested_state").unwrap(), 8);

        registry.execute("odrv0.save_configuration").unwrap();
        assert_eq!(device.call_count("save_configuration"), 1);

        let info = registry.endpoint_info("odrv0.hw_version_major").unwrap();
        assert!(info.read_only);
        assert_eq!(info.full_path(), "odrv0.hw_version_major");

        assert!(matches!(
            registry.read_value("odrv3.vbus_voltage"),
            Err(BackendError::SlotEmpty(3))
        ));
        assert!(matches!(
            registry.endpoint_info("odrv0.nope"),
            Err(BackendError::UnknownEndpoint(_))
        ));
    }

    #[test]
    fn test_refresh_value_cache() {
        let bus = SimulatedBus::new();
        let device = SimulatedOdrive::new();
        device.set_value("axis0.controller.input_pos", EndpointValue::new(2.0f32));
        bus.plug(&device);

        let registry = registry(&bus);
        registry.scan().unwrap();

        let stored = registry.refresh_value_cache(0).unwrap();
        let schema = registry.endpoint_tree(0).unwrap();
        assert_eq!(stored, schema.scalars().count());

        let snapshot = registry.cache_snapshot();
        assert_eq!(
            snapshot.get("odrv0.axis0.controller.input_pos"),
            Some(&EndpointValue::new(2.0f32))
        );
        assert!(snapshot.keys().all(|path| path.starts_with("odrv0.")));
        assert!(!snapshot.contains_key("odrv0.save_configuration"));
    }

    #[test]
    fn test_refresh_skips_unreadable_endpoint() {
        let schema = r#"[
            {"name":"serial_number","id":1,"type":"uint64","access":"r"},
            {"name":"vbus_voltage","id":2,"type":"float","access":"r"},
            {"name":"axis0","type":"object","members":[
                {"name":"input_ref","id":3,"type":"endpoint_ref","access":"rw"},
                {"name":"vel_limit","id":4,"type":"float","access":"rw"}
            ]}
        ]"#;
        let bus = SimulatedBus::new();
        let device = SimulatedOdrive::with_schema(schema).with_serial_number(0x31);
        device.set_value("axis0.vel_limit", EndpointValue::new(10.0f32));
        bus.plug(&device);

        let registry = registry(&bus);
        registry.scan().unwrap();

        assert_eq!(registry.refresh_value_cache(0).unwrap(), 3);
        let snapshot = registry.cache_snapshot();
        assert_eq!(
            snapshot.get("odrv0.axis0.vel_limit"),
            Some(&EndpointValue::new(10.0f32))
        );
        assert!(snapshot.contains_key("odrv0.vbus_voltage"));
        assert!(snapshot.contains_key("odrv0.serial_number"));
        assert!(!snapshot.contains_key("odrv0.axis0.input_ref"));
        assert!(registry.session(0).unwrap().is_ready());
    }

    #[test]
    fn test_aborted_refresh_keeps_previous_values() {
        let bus = SimulatedBus::new();
        let device = SimulatedOdrive::new();
        device.set_value("vbus_voltage", EndpointValue::new(24.0f32));
        bus.plug(&device);

        let registry = registry(&bus);
        registry.scan().unwrap();
        registry.refresh_value_cache(0).unwrap();
        let before = registry.cache_snapshot();

        device.set_value("vbus_voltage", EndpointValue::new(12.0f32));
        device.inject_zero_length_reads(1);
        assert!(matches!(
            registry.refresh_value_cache(0),
            Err(BackendError::TransportDisconnected)
        ));
        assert_eq!(registry.cache_snapshot(), before);
        assert_eq!(
            registry.cached_value("odrv0.vbus_voltage"),
            Some(EndpointValue::new(24.0f32))
        );
    }

    #[test]
    fn test_remove_prunes_cache() {
        let bus = SimulatedBus::new();
        let device = SimulatedOdrive::new();
        bus.plug(&device);

        let registry = registry(&bus);
        registry.scan().unwrap();
        registry.refresh_value_cache(0).unwrap();
        assert!(!registry.cache_snapshot().is_empty());

        let session = registry.remove(0).unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(registry.cache_snapshot().is_empty());
        assert!(!device.is_open());
        assert!(matches!(registry.remove(0), Err(BackendError::SlotEmpty(0))));
    }

    #[test]
    fn test_status_per_slot() {
        let bus = SimulatedBus::new();
        let device = SimulatedOdrive::new();
        device.set_value("axis0.motor.error", EndpointValue::new(0x8i32));
        bus.plug(&device);

        let registry = registry(&bus);
        registry.scan().unwrap();
        assert!(registry.status(0).unwrap().connected);
        assert_eq!(registry.status(0).unwrap().motor_error, 0);

        let refreshed = registry.refresh_statuses();
        assert_eq!(refreshed.len(), 1);
        assert_eq!(refreshed[0].1.motor_error, 0x8);
        assert_eq!(registry.statuses()[0].1.motor_error, 0x8);
    }
}
