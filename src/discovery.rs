//! Endpoint discovery.
//!
//! A discoverer resolves the node a connection should dial. It runs once
//! before the first dial of every connect cycle and again after each failed
//! dial, so cluster-aware implementations can steer reconnects toward a
//! healthy node.

use async_trait::async_trait;

use crate::config::Endpoint;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// No serving node could be found.
    #[error("no node available: {0}")]
    NoNodeAvailable(String),
    /// The discovery request itself failed.
    #[error("discovery request failed: {0}")]
    Request(String),
}

/// Resolves the endpoint to dial.
#[async_trait]
pub trait EndpointDiscoverer: Send + Sync {
    async fn discover(&self) -> Result<Endpoint, DiscoveryError>;
}

/// Discoverer that always answers with the same endpoint.
#[derive(Debug, Clone)]
pub struct StaticDiscoverer {
    endpoint: Endpoint,
}

impl StaticDiscoverer {
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl EndpointDiscoverer for StaticDiscoverer {
    async fn discover(&self) -> Result<Endpoint, DiscoveryError> {
        Ok(self.endpoint.clone())
    }
}
