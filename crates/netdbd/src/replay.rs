//! Capture replay provider.
//!
//! Serves a snapshot plus a timed event stream from a JSON capture
//! file. Useful for demos and for soak-testing the engine without a
//! kernel socket:
//!
//! ```json
//! {
//!   "links": [{"kind": "link", "op": "set", "fields": {"ifname": "eth0"}}],
//!   "stream": [
//!     {"delay_ms": 500, "records": [
//!       {"kind": "link", "op": "set", "fields": {"ifname": "eth0", "state": "down"}}
//!     ]}
//!   ]
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use netdb::{Provider, ProviderEvent, Record};

#[derive(Debug, Deserialize)]
struct Capture {
    #[serde(default)]
    links: Vec<Record>,
    #[serde(default)]
    addresses: Vec<Record>,
    #[serde(default)]
    neighbours: Vec<Record>,
    #[serde(default)]
    routes: Vec<Record>,
    #[serde(default)]
    stream: Vec<StreamStep>,
}

#[derive(Debug, Deserialize)]
struct StreamStep {
    #[serde(default)]
    delay_ms: u64,
    records: Vec<Record>,
}

/// Provider replaying a recorded capture.
#[derive(Debug)]
pub struct ReplayProvider {
    capture: Capture,
    cursor: usize,
}

impl ReplayProvider {
    /// Loads a capture file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading capture {}", path.as_ref().display()))?;
        let capture = serde_json::from_str(&text)
            .with_context(|| format!("parsing capture {}", path.as_ref().display()))?;
        Ok(Self { capture, cursor: 0 })
    }
}

#[async_trait]
impl Provider for ReplayProvider {
    async fn bind(&mut self) -> Result<()> {
        Ok(())
    }

    async fn links(&mut self) -> Result<Vec<Record>> {
        Ok(self.capture.links.clone())
    }

    async fn addresses(&mut self) -> Result<Vec<Record>> {
        Ok(self.capture.addresses.clone())
    }

    async fn neighbours(&mut self) -> Result<Vec<Record>> {
        Ok(self.capture.neighbours.clone())
    }

    async fn routes(&mut self) -> Result<Vec<Record>> {
        Ok(self.capture.routes.clone())
    }

    async fn next_event(&mut self) -> Result<ProviderEvent> {
        match self.capture.stream.get(self.cursor) {
            Some(step) => {
                self.cursor += 1;
                tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;
                Ok(ProviderEvent::Records(step.records.clone()))
            }
            // Replay exhausted; idle like a quiet kernel.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_replays_snapshot_and_stream() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "links": [{{"kind": "link", "op": "set", "fields": {{"ifname": "eth0"}}}}],
                "stream": [
                    {{"records": [{{"kind": "link", "op": "del", "fields": {{"ifname": "eth0"}}}}]}}
                ]
            }}"#
        )
        .unwrap();

        let mut provider = ReplayProvider::from_file(file.path()).unwrap();
        assert_eq!(provider.links().await.unwrap().len(), 1);
        assert!(provider.routes().await.unwrap().is_empty());

        match provider.next_event().await.unwrap() {
            ProviderEvent::Records(records) => assert_eq!(records.len(), 1),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_malformed_capture() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"links\": 42}}").unwrap();
        assert!(ReplayProvider::from_file(file.path()).is_err());
    }
}
