//! Gateway Metadata Boundary
//!
//! Connecting needs three facts from outside the gateway socket: the URL,
//! the recommended shard count, and the identify concurrency limit. The
//! REST call that provides them is the embedder's concern, behind a trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FleetError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    pub max_concurrency: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub url: String,
    /// Recommended shard count
    pub shards: u16,
    pub session_start_limit: SessionStartLimit,
}

/// External call boundary for gateway metadata.
#[async_trait]
pub trait GatewayInfoProvider: Send + Sync {
    async fn gateway_info(&self) -> Result<GatewayInfo, FleetError>;
}

/// Provider backed by a fixed value, for tests and pre-resolved setups.
pub struct StaticGatewayInfo(pub GatewayInfo);

#[async_trait]
impl GatewayInfoProvider for StaticGatewayInfo {
    async fn gateway_info(&self) -> Result<GatewayInfo, FleetError> {
        Ok(self.0.clone())
    }
}
