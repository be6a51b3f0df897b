//! Configuration types for a sensor ring node.

use crate::error::{Error, Result};
use crate::types::{HostMap, NodeId};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for a ring node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Address advertised to other nodes (`host:port`).
    pub address: String,

    /// Address to bind the RPC server to.
    /// If None, binds `0.0.0.0` on the port of `address`.
    pub bind_addr: Option<SocketAddr>,

    /// Initial peer hints (node_id -> address). May or may not include self.
    pub initial_hosts: HostMap,

    /// Artificial delay before every hop, for demonstrations.
    pub hop_delay: Option<Duration>,

    /// Failure detection timeouts.
    pub timeouts: TimeoutConfig,

    /// Sliding window used to reduce raw measurements.
    pub window: WindowConfig,

    /// Where completed rounds and membership are published.
    pub gateway: GatewayMode,

    /// Interval between two simulated raw measurements.
    pub simulator_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            address: "localhost:8080".to_string(),
            bind_addr: None,
            initial_hosts: HostMap::new(),
            hop_delay: None,
            timeouts: TimeoutConfig::default(),
            window: WindowConfig::default(),
            gateway: GatewayMode::Disabled,
            simulator_interval: Duration::from_millis(100),
        }
    }
}

impl NodeConfig {
    /// Create a new configuration with the given node ID and address.
    pub fn new(node_id: NodeId, address: impl Into<String>) -> Self {
        Self {
            node_id,
            address: address.into(),
            ..Default::default()
        }
    }

    /// Set the initial peer hints.
    pub fn with_initial_hosts(mut self, hosts: HostMap) -> Self {
        self.initial_hosts = hosts;
        self
    }

    /// Set an explicit bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Set the artificial inter-hop delay.
    pub fn with_hop_delay(mut self, delay: Duration) -> Self {
        self.hop_delay = Some(delay);
        self
    }

    /// Set timeout configuration.
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set sliding window configuration.
    pub fn with_window(mut self, window: WindowConfig) -> Self {
        self.window = window;
        self
    }

    /// Set the gateway mode.
    pub fn with_gateway(mut self, gateway: GatewayMode) -> Self {
        self.gateway = gateway;
        self
    }

    /// Set the simulator interval.
    pub fn with_simulator_interval(mut self, interval: Duration) -> Self {
        self.simulator_interval = interval;
        self
    }

    /// Port part of the advertised address.
    pub fn advertised_port(&self) -> Result<u16> {
        address_port(&self.address)
    }

    /// Get the bind address, defaulting to all interfaces on the advertised port.
    pub fn get_bind_addr(&self) -> Result<SocketAddr> {
        match self.bind_addr {
            Some(addr) => Ok(addr),
            None => Ok(SocketAddr::new(
                Ipv4Addr::UNSPECIFIED.into(),
                self.advertised_port()?,
            )),
        }
    }

    /// Check the configuration for values the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.advertised_port()?;
        self.window.validate()?;
        if self.timeouts.per_hop.is_zero() {
            return Err(Error::Config("per-hop timeout must be positive".to_string()));
        }
        for (id, addr) in &self.initial_hosts {
            address_port(addr)
                .map_err(|e| Error::Config(format!("initial host {}: {}", id, e)))?;
        }
        if let Some(addr) = self.initial_hosts.get(&self.node_id) {
            if addr != &self.address {
                return Err(Error::Config(format!(
                    "initial hosts list node {} at '{}' but this node advertises '{}'",
                    self.node_id, addr, self.address
                )));
            }
        }
        Ok(())
    }
}

/// Port of a `host:port` address; the host must not be empty.
fn address_port(address: &str) -> Result<u16> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("address '{}' has no port", address)))?;
    if host.is_empty() {
        return Err(Error::Config(format!("address '{}' has no host", address)));
    }
    port.parse()
        .map_err(|e| Error::Config(format!("invalid port in '{}': {}", address, e)))
}

/// Failure detection timeouts.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Time budget per ring hop; ring timeouts scale it by the ring size.
    pub per_hop: Duration,

    /// Maximum time to wait for a peer's acknowledgment.
    pub rpc_timeout: Duration,

    /// Maximum time to open a connection to a peer.
    pub connect_timeout: Duration,

    /// Delay before a lone node passes its token back to itself.
    pub solo_recirculation: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            per_hop: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            solo_recirculation: Duration::from_secs(1),
        }
    }
}

impl TimeoutConfig {
    /// Short timeouts for in-process test rings.
    pub fn fast() -> Self {
        Self {
            per_hop: Duration::from_millis(150),
            rpc_timeout: Duration::from_millis(300),
            connect_timeout: Duration::from_millis(200),
            solo_recirculation: Duration::from_millis(50),
        }
    }

    /// Set the per-hop budget.
    pub fn with_per_hop(mut self, per_hop: Duration) -> Self {
        self.per_hop = per_hop;
        self
    }

    /// Set the RPC timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }
}

/// Overlapping sliding window parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowConfig {
    /// Number of raw measurements per window.
    pub capacity: usize,

    /// Fraction of the window shared by two consecutive windows.
    pub overlap: f64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            overlap: 0.5,
        }
    }
}

impl WindowConfig {
    /// Number of new measurements between two reductions.
    pub fn step(&self) -> usize {
        ((self.capacity as f64 * self.overlap) as usize).max(1)
    }

    fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Config("window capacity must be positive".to_string()));
        }
        if !(self.overlap > 0.0 && self.overlap <= 1.0) {
            return Err(Error::Config(format!(
                "window overlap must be in (0, 1], got {}",
                self.overlap
            )));
        }
        Ok(())
    }
}

/// Where a node publishes its results.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayMode {
    /// Append results to a local file instead of a gateway.
    Mock { log_path: PathBuf },

    /// REST gateway reachable at `base_url`.
    Remote { base_url: String },

    /// Log results only.
    Disabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.node_id, 1);
        assert_eq!(config.window.capacity, 10);
        assert_eq!(config.gateway, GatewayMode::Disabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::new(42, "localhost:9042")
            .with_hop_delay(Duration::from_millis(500))
            .with_window(WindowConfig {
                capacity: 20,
                overlap: 0.25,
            });

        assert_eq!(config.node_id, 42);
        assert_eq!(config.hop_delay, Some(Duration::from_millis(500)));
        assert_eq!(config.window.step(), 5);
        assert_eq!(
            config.get_bind_addr().unwrap(),
            "0.0.0.0:9042".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_window_step() {
        assert_eq!(WindowConfig::default().step(), 5);
        let tiny = WindowConfig {
            capacity: 1,
            overlap: 0.5,
        };
        assert_eq!(tiny.step(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(NodeConfig::new(1, "localhost").validate().is_err());
        assert!(NodeConfig::new(1, "localhost:abc").validate().is_err());

        let config = NodeConfig::new(1, "localhost:8080").with_window(WindowConfig {
            capacity: 10,
            overlap: 1.5,
        });
        assert!(config.validate().is_err());

        let mut hosts = HostMap::new();
        hosts.insert(1, "elsewhere:1".to_string());
        let config = NodeConfig::new(1, "localhost:8080").with_initial_hosts(hosts);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_checks_initial_hosts() {
        for bad in ["foo", "foo:bar", ":8081", "foo:70000"] {
            let mut hosts = HostMap::new();
            hosts.insert(2, bad.to_string());
            let config = NodeConfig::new(1, "localhost:8080").with_initial_hosts(hosts);
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("initial host 2"), "{}: {}", bad, err);
        }

        let mut hosts = HostMap::new();
        hosts.insert(2, "localhost:8081".to_string());
        hosts.insert(3, "10.0.0.3:8082".to_string());
        let config = NodeConfig::new(1, "localhost:8080").with_initial_hosts(hosts);
        assert!(config.validate().is_ok());
    }
}
