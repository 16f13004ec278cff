use parking_lot::Mutex;
use std::collections::HashMap;

use crate::sensor::SensorType;

/// Remembers which device each sensor type was last paired with
///
/// Implementations back this with whatever persistence the host has. The
/// supervisor reads it when opening a channel and writes it when a wildcard
/// search finds a device.
pub trait PairingStore: Send + Sync {
    /// Device number last paired for the sensor type
    fn get(&self, sensor: SensorType) -> Option<u16>;

    /// Record a newly paired device number
    fn set(&self, sensor: SensorType, device_number: u16);
}

/// In-process pairing store
#[derive(Debug, Default)]
pub struct MemoryPairingStore {
    devices: Mutex<HashMap<SensorType, u16>>,
}

impl MemoryPairingStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding the given pairings
    pub fn with_pairings(pairings: impl IntoIterator<Item = (SensorType, u16)>) -> Self {
        Self {
            devices: Mutex::new(pairings.into_iter().collect()),
        }
    }

    /// Drop the pairing for a sensor type so the next open searches again
    pub fn forget(&self, sensor: SensorType) -> Option<u16> {
        self.devices.lock().remove(&sensor)
    }
}

impl PairingStore for MemoryPairingStore {
    fn get(&self, sensor: SensorType) -> Option<u16> {
        self.devices.lock().get(&sensor).copied()
    }

    fn set(&self, sensor: SensorType, device_number: u16) {
        self.devices.lock().insert(sensor, device_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryPairingStore::new();
        assert_eq!(store.get(SensorType::HeartRate), None);

        store.set(SensorType::HeartRate, 1234);
        store.set(SensorType::HeartRate, 4321);
        assert_eq!(store.get(SensorType::HeartRate), Some(4321));
        assert_eq!(store.get(SensorType::BikeCadence), None);

        assert_eq!(store.forget(SensorType::HeartRate), Some(4321));
        assert_eq!(store.get(SensorType::HeartRate), None);
    }

    #[test]
    fn test_with_pairings() {
        let store = MemoryPairingStore::with_pairings([(SensorType::BikeSpeedCadence, 77)]);
        assert_eq!(store.get(SensorType::BikeSpeedCadence), Some(77));
    }
}
