//! Logical ring over the known members.

pub mod topology;

pub use topology::{compute_ring_order, Neighbour, RingTopology};
