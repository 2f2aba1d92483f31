//! Fixed-size temperature history per sensor, lazily created on first touch
//! and kept behind a single lock.

use std::collections::{HashMap, VecDeque};

use tokio::sync::RwLock;

const RING_LEN: usize = 1200;

#[derive(Debug, Clone)]
struct Ring {
    samples: VecDeque<f64>,
}

impl Ring {
    fn new() -> Self {
        let mut samples = VecDeque::with_capacity(RING_LEN);
        samples.resize(RING_LEN, 0.0);
        Self { samples }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() >= RING_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn last(&self) -> f64 {
        *self.samples.back().unwrap_or(&0.0)
    }
}

/// Per-sensor temperature ring, fed from status-update fan-out and a 1 Hz
/// background tick so the history stays continuous even without active
/// subscribers.
#[derive(Default)]
pub struct TemperatureStore {
    sensors: RwLock<HashMap<String, Ring>>,
}

impl TemperatureStore {
    pub fn new() -> Self {
        Self {
            sensors: RwLock::new(HashMap::new()),
        }
    }

    /// Record a fresh sample for `sensor`. Creates the ring on first touch.
    pub async fn record(&self, sensor: &str, value: f64) {
        let mut sensors = self.sensors.write().await;
        sensors
            .entry(sensor.to_owned())
            .or_insert_with(Ring::new)
            .push(value);
    }

    /// Advance every known sensor's ring by one tick, repeating the last
    /// value. Sensors with no samples yet are left untouched.
    pub async fn tick(&self) {
        let mut sensors = self.sensors.write().await;
        for ring in sensors.values_mut() {
            let last = ring.last();
            ring.push(last);
        }
    }

    pub async fn snapshot(&self) -> HashMap<String, Vec<f64>> {
        self.sensors
            .read()
            .await
            .iter()
            .map(|(name, ring)| (name.clone(), ring.samples.iter().copied().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_sensor_starts_as_all_zero() {
        let store = TemperatureStore::new();
        store.record("extruder", 200.0).await;
        let snap = store.snapshot().await;
        let ring = &snap["extruder"];
        assert_eq!(ring.len(), RING_LEN);
        assert_eq!(ring[RING_LEN - 1], 200.0);
        assert_eq!(ring[0], 0.0);
    }

    #[tokio::test]
    async fn ring_evicts_oldest_past_capacity() {
        let store = TemperatureStore::new();
        for i in 0..RING_LEN + 5 {
            store.record("bed", i as f64).await;
        }
        let snap = store.snapshot().await;
        let ring = &snap["bed"];
        assert_eq!(ring.len(), RING_LEN);
        assert_eq!(ring[RING_LEN - 1], (RING_LEN + 4) as f64);
    }

    #[tokio::test]
    async fn tick_repeats_last_value_for_known_sensors() {
        let store = TemperatureStore::new();
        store.record("bed", 60.0).await;
        store.tick().await;
        let snap = store.snapshot().await;
        assert_eq!(snap["bed"][RING_LEN - 1], 60.0);
    }
}
