//! Membership discovery and leader election.

pub mod engine;
pub mod token;

pub use engine::{DiscoveryEngine, DiscoveryEvent, DiscoveryStep, ParticipationState};
pub use token::{DiscoveryToken, DiscoveryTokenKind};
