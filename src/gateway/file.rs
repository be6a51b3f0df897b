use super::GatewaySink;
use crate::error::{GatewayError, Result};
use crate::types::{HostMap, NodeId, Reading};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;

/// Appends human-readable reports to a local file.
#[derive(Debug, Clone)]
pub struct FileLoggerSink {
    path: PathBuf,
}

impl FileLoggerSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn block(
        operation: &str,
        sender_id: NodeId,
        entries: impl Iterator<Item = (NodeId, String)>,
    ) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        let mut out = format!("--- {} by {} at {} ---\n", operation, sender_id, millis);
        for (id, value) in entries {
            let _ = writeln!(out, "Node {}: {}", id, value);
        }
        out.push('\n');
        out
    }

    async fn append(&self, text: &str) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| GatewayError::Io(format!("{}: {}", self.path.display(), e)))?;
        file.write_all(text.as_bytes())
            .await
            .map_err(|e| GatewayError::Io(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| GatewayError::Io(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl GatewaySink for FileLoggerSink {
    async fn join(&self, _id: NodeId, _address: &str) -> Result<HostMap> {
        Ok(HostMap::new())
    }

    async fn publish_readings(
        &self,
        sender_id: NodeId,
        readings: &BTreeMap<NodeId, Reading>,
    ) -> Result<()> {
        // Debug keeps the decimal point on whole readings.
        let entries = readings.iter().map(|(id, v)| (*id, format!("{:?}", v)));
        self.append(&Self::block("publishNewAverage", sender_id, entries))
            .await
    }

    async fn publish_membership(&self, sender_id: NodeId, hosts: &HostMap) -> Result<()> {
        let entries = hosts.iter().map(|(id, host)| (*id, host.clone()));
        self.append(&Self::block("publishNewHosts", sender_id, entries))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_appends_reports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.log");
        let sink = FileLoggerSink::new(&path);

        let mut readings = BTreeMap::new();
        readings.insert(1, 10.0);
        readings.insert(2, 8.5);
        sink.publish_readings(2, &readings).await.unwrap();

        let mut hosts = HostMap::new();
        hosts.insert(1, "localhost:8080".to_string());
        sink.publish_membership(1, &hosts).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].starts_with("--- publishNewAverage by 2 at "));
        assert_eq!(lines[1], "Node 1: 10.0");
        assert_eq!(lines[2], "Node 2: 8.5");
        assert_eq!(lines[3], "");
        assert!(lines[4].starts_with("--- publishNewHosts by 1 at "));
        assert_eq!(lines[5], "Node 1: localhost:8080");
    }

    #[tokio::test]
    async fn test_unwritable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileLoggerSink::new(dir.path().join("missing").join("gateway.log"));
        assert!(sink.publish_readings(1, &BTreeMap::new()).await.is_err());
    }
}
