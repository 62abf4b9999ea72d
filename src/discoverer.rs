//! Discoverer Client (C7, spec §4.7): talks to the swarm-listener sidecar that watches the
//! container orchestrator and reports services out-of-band from the HTTP reconfigure API.

use crate::error::{ProxyError, Result};
use crate::service::AttrMap;
use std::time::Duration;

/// The Discoverer Client's operations, behind a trait so the Reconciler (C5) can inject a fake
/// in tests.
#[async_trait::async_trait]
pub trait Discoverer: Send + Sync {
    /// Ask the listener to (re-)announce every service it currently knows about; the listener
    /// answers asynchronously by calling back into this process's reconfigure endpoint, so this
    /// only confirms the request was accepted (spec §4.7 "fire-and-forget").
    async fn notify(&self, listener_addr: &str) -> Result<()>;

    /// Synchronously pull the full service list from the listener (used by `reload --recreate`
    /// to rebuild state from scratch rather than waiting on notifications).
    async fn get_services(&self, listener_addr: &str) -> Result<Vec<AttrMap>>;
}

pub struct SwarmListenerClient {
    client: reqwest::Client,
}

impl Default for SwarmListenerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SwarmListenerClient {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(10))
    }

    #[allow(clippy::expect_used)]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            // Only fails on a bad TLS backend/DNS resolver build, which means the process can't
            // do anything useful anyway.
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client builder"),
        }
    }
}

#[async_trait::async_trait]
impl Discoverer for SwarmListenerClient {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn notify(&self, listener_addr: &str) -> Result<()> {
        if listener_addr.is_empty() {
            return Err(ProxyError::DiscovererError("swarm listener address is missing".into()));
        }
        let url = format!(
            "{}/v1/docker-flow-swarm-listener/notify-services",
            listener_addr.trim_end_matches('/')
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| ProxyError::DiscovererError(format!("request to {url} failed: {err}")))?;

        if !resp.status().is_success() {
            return Err(ProxyError::DiscovererError(format!(
                "swarm listener at {listener_addr} responded with status {}",
                resp.status()
            )));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_services(&self, listener_addr: &str) -> Result<Vec<AttrMap>> {
        if listener_addr.is_empty() {
            return Err(ProxyError::DiscovererError("swarm listener address is missing".into()));
        }
        let url = format!(
            "{}/v1/docker-flow-swarm-listener/get-services",
            listener_addr.trim_end_matches('/')
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| ProxyError::DiscovererError(format!("request to {url} failed: {err}")))?;

        if !resp.status().is_success() {
            return Err(ProxyError::DiscovererError(format!(
                "swarm listener at {listener_addr} responded with status {}",
                resp.status()
            )));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|err| ProxyError::DiscovererError(format!("reading body from {listener_addr} failed: {err}")))?;
        serde_json::from_slice(&body).map_err(ProxyError::DecodeError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_rejects_empty_listener_address() {
        let client = SwarmListenerClient::new();
        let err = client.notify("").await.unwrap_err();
        assert!(matches!(err, ProxyError::DiscovererError(_)));
    }

    #[tokio::test]
    async fn get_services_rejects_empty_listener_address() {
        let client = SwarmListenerClient::new();
        let err = client.get_services("").await.unwrap_err();
        assert!(matches!(err, ProxyError::DiscovererError(_)));
    }
}
