//! Sensor data acquisition and the sensor-reading token.

pub mod readings;
pub mod simulator;
pub mod window;

pub use readings::{Circulation, CompletedRound, SensorReadingsToken, TokenCirculationEngine};
pub use simulator::Pm10Simulator;
pub use window::{average, maximum, Measurement, MeasurementSink, Reducer, SlidingWindowReducer};
