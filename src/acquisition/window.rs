//! Overlapping sliding window over raw measurements.

use crate::config::WindowConfig;
use crate::types::Reading;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// A raw sample produced by a sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub id: String,
    pub kind: String,
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Measurement {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, value: f64, timestamp: u64) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            value,
            timestamp,
        }
    }
}

/// Destination of raw measurements.
pub trait MeasurementSink: Send + Sync {
    fn add_measurement(&self, measurement: Measurement);
}

/// Reduces one full window to a single reading.
pub type Reducer = fn(&[f64]) -> Reading;

/// Arithmetic mean.
pub fn average(values: &[f64]) -> Reading {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Largest value.
pub fn maximum(values: &[f64]) -> Reading {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

struct WindowBuffer {
    values: Vec<f64>,
    write_index: usize,
    written: u64,
}

/// Ring buffer that emits a reduced reading every `step` measurements once
/// the window has been filled.
///
/// Any number of tasks may push and poll concurrently.
pub struct SlidingWindowReducer {
    capacity: usize,
    step: u64,
    reducer: Reducer,
    buffer: Mutex<WindowBuffer>,
    reduced: Mutex<VecDeque<Reading>>,
    notify: Notify,
}

impl SlidingWindowReducer {
    /// Create an averaging window.
    pub fn new(config: WindowConfig) -> Self {
        Self::with_reducer(config, average)
    }

    /// Create a window with a custom reducer.
    pub fn with_reducer(config: WindowConfig, reducer: Reducer) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            capacity,
            step: config.step() as u64,
            reducer,
            buffer: Mutex::new(WindowBuffer {
                values: Vec::with_capacity(capacity),
                write_index: 0,
                written: 0,
            }),
            reduced: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Add one raw value.
    pub fn push(&self, value: f64) {
        let reduced = {
            let mut buffer = self.buffer.lock();
            let index = buffer.write_index;
            if buffer.values.len() < self.capacity {
                buffer.values.push(value);
            } else {
                buffer.values[index] = value;
            }
            buffer.write_index = (index + 1) % self.capacity;
            buffer.written += 1;

            let full = buffer.written >= self.capacity as u64;
            if full && buffer.written % self.step == 0 {
                Some((self.reducer)(&buffer.values))
            } else {
                None
            }
        };

        if let Some(reading) = reduced {
            trace!(reading, "New reduced reading");
            self.reduced.lock().push_back(reading);
            self.notify.notify_one();
        }
    }

    /// Take the oldest reduced reading, if any.
    pub fn poll_reduced(&self) -> Option<Reading> {
        self.reduced.lock().pop_front()
    }

    /// Number of reduced readings waiting.
    pub fn pending(&self) -> usize {
        self.reduced.lock().len()
    }

    /// Wait up to `timeout` for a reduced reading.
    pub async fn next_reduced(&self, timeout: Duration) -> Option<Reading> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reading) = self.poll_reduced() {
                return Some(reading);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.poll_reduced();
            }
        }
    }
}

impl MeasurementSink for SlidingWindowReducer {
    fn add_measurement(&self, measurement: Measurement) {
        self.push(measurement.value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn window(capacity: usize, overlap: f64) -> SlidingWindowReducer {
        SlidingWindowReducer::new(WindowConfig { capacity, overlap })
    }

    #[test]
    fn test_overlapping_average() {
        let reducer = window(10, 0.5);

        for _ in 0..9 {
            reducer.push(10.0);
        }
        assert_eq!(reducer.poll_reduced(), None);

        reducer.push(10.0);
        assert_eq!(reducer.poll_reduced(), Some(10.0));
        assert_eq!(reducer.poll_reduced(), None);

        for _ in 0..4 {
            reducer.push(6.0);
        }
        assert_eq!(reducer.pending(), 0);
        reducer.push(6.0);
        assert_eq!(reducer.poll_reduced(), Some(8.0));
    }

    #[test]
    fn test_readings_queue_in_order() {
        let reducer = window(4, 0.5);
        for v in [1.0, 1.0, 1.0, 1.0, 3.0, 3.0, 5.0, 5.0] {
            reducer.push(v);
        }
        assert_eq!(reducer.pending(), 3);
        assert_eq!(reducer.poll_reduced(), Some(1.0));
        assert_eq!(reducer.poll_reduced(), Some(2.0));
        assert_eq!(reducer.poll_reduced(), Some(4.0));
    }

    #[test]
    fn test_custom_reducer() {
        let reducer = SlidingWindowReducer::with_reducer(
            WindowConfig {
                capacity: 3,
                overlap: 1.0,
            },
            maximum,
        );
        for v in [2.0, 9.0, 4.0] {
            reducer.add_measurement(Measurement::new("pm10-1", "PM10", v, 0));
        }
        assert_eq!(reducer.poll_reduced(), Some(9.0));
    }

    #[test]
    fn test_average_of_empty_window() {
        assert_eq!(average(&[]), 0.0);
        assert_eq!(average(&[1.0, 2.0, 3.0]), 2.0);
    }

    #[tokio::test]
    async fn test_next_reduced_waits_for_producer() {
        let reducer = Arc::new(window(2, 0.5));

        assert_eq!(reducer.next_reduced(Duration::from_millis(20)).await, None);

        let producer = reducer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(4.0);
            producer.push(8.0);
        });

        let reading = reducer.next_reduced(Duration::from_secs(2)).await;
        assert_eq!(reading, Some(6.0));
    }
}
