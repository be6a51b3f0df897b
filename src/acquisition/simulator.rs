//! Synthetic PM10 measurement producer.

use crate::acquisition::window::{Measurement, MeasurementSink};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::debug;

const MEAN: f64 = 40.0;
const REVERSION: f64 = 0.1;
const NOISE: f64 = 2.5;
const SPIKE_PROBABILITY: f64 = 0.02;
const SPIKE_HEIGHT: f64 = 35.0;

/// Mean-reverting random walk with occasional spikes.
#[derive(Debug, Clone)]
struct Pm10Walk {
    level: f64,
}

impl Pm10Walk {
    fn next_value(&mut self) -> f64 {
        let mut rng = rand::rng();
        let noise = rng.random_range(-NOISE..=NOISE);
        self.level += REVERSION * (MEAN - self.level) + noise;
        self.level = self.level.max(0.0);

        if rng.random::<f64>() < SPIKE_PROBABILITY {
            self.level + rng.random_range(0.0..SPIKE_HEIGHT)
        } else {
            self.level
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Background task feeding PM10 samples into a sink.
pub struct Pm10Simulator {
    handle: JoinHandle<()>,
}

impl Pm10Simulator {
    /// Start producing a sample every `interval`.
    pub fn spawn(
        sensor_id: impl Into<String>,
        sink: Arc<dyn MeasurementSink>,
        interval: Duration,
    ) -> Self {
        let sensor_id = sensor_id.into();
        debug!(sensor = %sensor_id, ?interval, "Starting PM10 simulator");

        let handle = tokio::spawn(async move {
            let mut walk = Pm10Walk { level: MEAN };
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let value = walk.next_value();
                sink.add_measurement(Measurement::new(
                    sensor_id.clone(),
                    "PM10",
                    value,
                    now_millis(),
                ));
            }
        });

        Self { handle }
    }

    /// Stop producing samples.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for Pm10Simulator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
