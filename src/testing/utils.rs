use crate::types::{HostMap, NodeId};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::time::sleep;

/// Reserve a loopback address per node by binding to port 0 and releasing it.
pub(crate) async fn loopback_addresses(node_ids: &[NodeId]) -> HostMap {
    let mut hosts = HostMap::new();
    for &node_id in node_ids {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        hosts.insert(node_id, addr.to_string());
    }
    hosts
}

/// Poll `condition` until it holds or `timeout` elapses.
pub(crate) async fn wait_for<F>(condition: F, timeout: Duration, check_interval: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(check_interval).await;
    }
    condition()
}

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
