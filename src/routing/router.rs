//! Gateway-side request routing
//!
//! Chooses a worker for each inbound request via the consistent-hash ring,
//! forwards the JSON body verbatim, and on transport failure retries the
//! remaining members once each, in ring-insertion order. Payload semantics
//! are never interpreted here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::routing::ring::HashRing;
use crate::utils::error::{MeshError, Result};

pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Gateway statistics, scoped to one router instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterStats {
    pub total_requests: u64,
    pub num_workers: usize,
    pub workers: Vec<String>,
}

/// Routes inbound requests to workers over HTTP.
pub struct Router {
    /// Membership edits take the write lock; lookups never observe a
    /// partially rebuilt ring.
    ring: RwLock<HashRing>,
    client: reqwest::Client,
    forward_timeout: Duration,
    total_requests: AtomicU64,
}

impl Router {
    pub fn new<I, S>(workers: I, forward_timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ring: RwLock::new(HashRing::with_default_replicas(workers)),
            client: reqwest::Client::new(),
            forward_timeout,
            total_requests: AtomicU64::new(0),
        }
    }

    /// Route one request: pick the primary via the ring, forward, and fail
    /// over through the remaining members on transport errors.
    pub async fn route(&self, request: Value) -> Result<Value> {
        let sequence = self.total_requests.fetch_add(1, Ordering::Relaxed) + 1;

        let key = request
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("req_{}", sequence));

        let primary = {
            let ring = self.ring.read().unwrap();
            ring.lookup(&key)
                .map_err(|_| MeshError::NoWorkersAvailable)?
                .to_string()
        };

        debug!(%key, worker = %primary, "routing request");
        let primary_err = match self.forward(&primary, &request).await {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };
        warn!(worker = %primary, error = %primary_err, "primary forward failed, trying failover");

        let members: Vec<String> = self.ring.read().unwrap().nodes().to_vec();
        for member in members.iter().filter(|m| **m != primary) {
            match self.forward(member, &request).await {
                Ok(response) => {
                    info!(%key, worker = %member, "failover succeeded");
                    return Ok(response);
                }
                Err(err) => {
                    warn!(worker = %member, error = %err, "failover attempt failed");
                }
            }
        }

        Err(MeshError::AllWorkersFailed {
            cause: primary_err.to_string(),
        })
    }

    /// One request/response exchange with a worker. Non-2xx statuses count
    /// as transport failures so the caller can fail over.
    async fn forward(&self, endpoint: &str, request: &Value) -> Result<Value> {
        let url = format!("{}/infer", endpoint);
        let response = self
            .client
            .post(&url)
            .timeout(self.forward_timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| MeshError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MeshError::Transport(format!(
                "{} responded {}: {}",
                endpoint, status, body
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| MeshError::Transport(e.to_string()))
    }

    /// Probe every worker's health endpoint and log what answered.
    pub async fn probe_workers(&self) {
        let members: Vec<String> = self.ring.read().unwrap().nodes().to_vec();
        for member in members {
            let url = format!("{}/health", member);
            match self
                .client
                .get(&url)
                .timeout(Duration::from_secs(2))
                .send()
                .await
            {
                Ok(response) => {
                    let node_id = response
                        .json::<Value>()
                        .await
                        .ok()
                        .and_then(|body| {
                            body.get("node_id").and_then(Value::as_str).map(str::to_owned)
                        })
                        .unwrap_or_else(|| "unknown".to_string());
                    info!(worker = %member, node_id = %node_id, "worker reachable");
                }
                Err(err) => {
                    warn!(worker = %member, error = %err, "worker health probe failed");
                }
            }
        }
    }

    pub fn add_worker(&self, endpoint: &str) {
        self.ring.write().unwrap().add_node(endpoint);
    }

    pub fn remove_worker(&self, endpoint: &str) {
        self.ring.write().unwrap().remove_node(endpoint);
    }

    pub fn forward_timeout(&self) -> Duration {
        self.forward_timeout
    }

    pub fn stats(&self) -> RouterStats {
        let ring = self.ring.read().unwrap();
        RouterStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            num_workers: ring.len(),
            workers: ring.nodes().to_vec(),
        }
    }
}
