//! Cross-process coordination over a RESP-speaking key-value backend.
//!
//! - [`resp`]: pure command encoder and resumable reply parser
//! - [`client`]: one-connection-per-call TCP/TLS client
//! - [`lock`]: `with_lock` mutual exclusion with token-checked release
//! - [`counter`]: fixed-window counters
//!
//! ## Degradation
//! When no backend URL is configured there is no client at all. Locks then
//! run their critical section directly and counters count in-process. That
//! is only correct for a single running instance, and it is explicit: a
//! configured backend that fails is always an error, never a silent fallback.

pub mod client;
pub mod counter;
pub mod lock;
pub mod resp;

#[cfg(test)]
pub(crate) mod memory;

pub use client::{Endpoint, RespClient};
pub use counter::CounterService;
pub use lock::{LockManager, LockToken};
pub use resp::{ProtocolError, Reply};

use crate::config::schema::CoordinationConfig;
use crate::error::MeteringError;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Anything that can answer a single RESP command.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Send one command and return its reply. Error replies are `Ok(Reply::Error)`.
    async fn command(&self, parts: &[&str]) -> Result<Reply, MeteringError>;
}

/// What the health endpoint reports about coordination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    pub enabled: bool,
    pub backend: &'static str,
    pub url_configured: bool,
}

impl BackendInfo {
    pub fn for_backend(backend: Option<&Arc<dyn CoordinationBackend>>, url_configured: bool) -> Self {
        Self {
            enabled: backend.is_some(),
            backend: if backend.is_some() { "resp" } else { "none" },
            url_configured,
        }
    }
}

/// Factory: build the backend client from config, or `None` when unconfigured.
pub fn create_backend(
    config: &CoordinationConfig,
) -> anyhow::Result<Option<Arc<dyn CoordinationBackend>>> {
    let Some(url) = config.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
        tracing::info!("No coordination backend configured; locks and counters are process-local");
        return Ok(None);
    };

    let client = RespClient::new(url, Duration::from_millis(config.timeout_ms.max(1)))?;
    tracing::info!(
        host = %client.endpoint().host,
        port = client.endpoint().port,
        tls = client.endpoint().tls,
        "Coordination backend configured"
    );
    Ok(Some(Arc::new(client)))
}
