//! Run one node of the sensor ring.
//!
//! Start a three node ring in three terminals with:
//!   RUST_LOG=info sensor-node --id 1 --address 127.0.0.1:9001 --peers 2=127.0.0.1:9002,3=127.0.0.1:9003
//!   RUST_LOG=info sensor-node --id 2 --address 127.0.0.1:9002 --peers 1=127.0.0.1:9001,3=127.0.0.1:9003
//!   RUST_LOG=info sensor-node --id 3 --address 127.0.0.1:9003 --peers 1=127.0.0.1:9001,2=127.0.0.1:9002

use clap::Parser;
use sensor_ring::gateway::sink_for;
use sensor_ring::types::parse_host_list;
use sensor_ring::{GatewayMode, HostMap, NodeConfig, SensorNode, TimeoutConfig, WindowConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sensor-node")]
struct Args {
    /// Unique node identifier.
    #[arg(long)]
    id: u64,

    /// Address advertised to the other nodes (host:port).
    #[arg(long)]
    address: String,

    /// Local address to listen on. Defaults to all interfaces on the advertised port.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Initial peer hints: "id=host:port,id=host:port".
    #[arg(long, value_parser = parse_host_list)]
    peers: Option<HostMap>,

    /// Delay before handing a token to the successor, in milliseconds.
    #[arg(long)]
    hop_delay_ms: Option<u64>,

    /// Per-hop failure detection timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    per_hop_ms: u64,

    /// Sliding window size in raw measurements.
    #[arg(long, default_value_t = 10)]
    window: usize,

    /// Fraction of the window shared by consecutive reductions.
    #[arg(long, default_value_t = 0.5)]
    overlap: f64,

    /// Interval between simulated measurements in milliseconds.
    #[arg(long, default_value_t = 100)]
    sample_ms: u64,

    /// Base URL of the gateway REST service.
    #[arg(long, conflicts_with = "mock_log")]
    gateway_url: Option<String>,

    /// Append publications to this file instead of calling a gateway.
    #[arg(long)]
    mock_log: Option<PathBuf>,
}

impl Args {
    fn gateway_mode(&self) -> GatewayMode {
        match (&self.gateway_url, &self.mock_log) {
            (Some(base_url), _) => GatewayMode::Remote {
                base_url: base_url.clone(),
            },
            (None, Some(log_path)) => GatewayMode::Mock {
                log_path: log_path.clone(),
            },
            (None, None) => GatewayMode::Disabled,
        }
    }

    fn node_config(&self, initial_hosts: HostMap) -> NodeConfig {
        let mut config = NodeConfig::new(self.id, self.address.clone())
            .with_initial_hosts(initial_hosts)
            .with_timeouts(
                TimeoutConfig::default().with_per_hop(Duration::from_millis(self.per_hop_ms)),
            )
            .with_window(WindowConfig {
                capacity: self.window,
                overlap: self.overlap,
            })
            .with_gateway(self.gateway_mode())
            .with_simulator_interval(Duration::from_millis(self.sample_ms));
        if let Some(bind) = self.bind {
            config = config.with_bind_addr(bind);
        }
        if let Some(ms) = self.hop_delay_ms {
            config = config.with_hop_delay(Duration::from_millis(ms));
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sensor_ring=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let gateway = sink_for(&args.gateway_mode())?;

    let mut initial_hosts = args.peers.clone().unwrap_or_default();
    match gateway.join(args.id, &args.address).await {
        Ok(known) => {
            for (id, host) in known {
                initial_hosts.entry(id).or_insert(host);
            }
        }
        Err(e) => warn!(node_id = args.id, error = %e, "Gateway join failed, using peer hints only"),
    }
    info!(node_id = args.id, peers = ?initial_hosts, "Initial peers");

    let node = SensorNode::start(args.node_config(initial_hosts), gateway).await?;
    info!(node_id = node.id(), addr = %node.local_addr(), "Node running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    node.shutdown().await;
    Ok(())
}
