//! Diff-based hotplug detection

use common::{DeviceCandidate, DeviceKey};
use std::collections::BTreeSet;

/// Devices that appeared or vanished since the previous scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HotplugChanges {
    pub arrived: Vec<DeviceCandidate>,
    pub departed: Vec<DeviceKey>,
}

impl HotplugChanges {
    pub fn is_empty(&self) -> bool {
        self.arrived.is_empty() && self.departed.is_empty()
    }
}

/// Remembers the previous enumeration and reports the difference
///
/// Each arrival is reported exactly once, no matter how many scans the device
/// stays attached for.
#[derive(Debug, Default)]
pub struct HotplugDiff {
    known: BTreeSet<DeviceKey>,
}

impl HotplugDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare `current` against the previous scan and remember it
    pub fn update(&mut self, current: &[DeviceCandidate]) -> HotplugChanges {
        let now: BTreeSet<DeviceKey> = current.iter().map(|c| c.key).collect();

        let arrived = current
            .iter()
            .filter(|c| !self.known.contains(&c.key))
            .cloned()
            .collect();
        let departed = self.known.difference(&now).copied().collect();

        self.known = now;
        HotplugChanges { arrived, departed }
    }

    /// Drop `key` so the next update reports it as arrived again
    ///
    /// Returns whether the key was known.
    pub fn forget(&mut self, key: DeviceKey) -> bool {
        self.known.remove(&key)
    }

    /// Keys seen by the last scan
    pub fn known(&self) -> impl Iterator<Item = &DeviceKey> {
        self.known.iter()
    }
}
