//! Health probe implementations.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use refresh_core::Ordinal;
use refresh_state::UnitState;
use tracing::debug;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The workload reports itself healthy.
    Healthy,
    /// The workload reports itself unhealthy.
    Unhealthy,
    /// Health could not be determined (connection error, timeout).
    Failed,
}

impl ProbeResult {
    /// Verdict stored on the unit. `Failed` counts as unhealthy.
    pub fn is_healthy(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// Boxed future returned by [`HealthProbe::probe`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = ProbeResult> + Send + 'a>>;

/// Workload-specific health probe.
pub trait HealthProbe: Send + Sync {
    fn probe<'a>(&'a self, unit: &'a UnitState) -> ProbeFuture<'a>;
}

/// Probes `http://{address}{endpoint}` where `address` is built from a
/// template containing `{ordinal}`.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    address_template: String,
    endpoint: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(address_template: &str, endpoint: &str, timeout: Duration) -> Self {
        Self {
            address_template: address_template.to_string(),
            endpoint: endpoint.to_string(),
            timeout,
        }
    }

    pub fn address_for(&self, ordinal: Ordinal) -> String {
        self.address_template
            .replace("{ordinal}", &ordinal.to_string())
    }
}

impl HealthProbe for HttpProbe {
    fn probe<'a>(&'a self, unit: &'a UnitState) -> ProbeFuture<'a> {
        Box::pin(async move {
            let address = self.address_for(unit.ordinal);
            http_probe(&address, &self.endpoint, self.timeout).await
        })
    }
}

/// Verdicts set by hand. Units without a verdict probe as `Failed`.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    verdicts: Arc<Mutex<HashMap<Ordinal, ProbeResult>>>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ordinal: Ordinal, result: ProbeResult) {
        if let Ok(mut verdicts) = self.verdicts.lock() {
            verdicts.insert(ordinal, result);
        }
    }

    pub fn set_all(&self, ordinals: impl IntoIterator<Item = Ordinal>, result: ProbeResult) {
        for ordinal in ordinals {
            self.set(ordinal, result);
        }
    }

    fn get(&self, ordinal: Ordinal) -> ProbeResult {
        self.verdicts
            .lock()
            .ok()
            .and_then(|verdicts| verdicts.get(&ordinal).copied())
            .unwrap_or(ProbeResult::Failed)
    }
}

impl HealthProbe for StaticProbe {
    fn probe<'a>(&'a self, unit: &'a UnitState) -> ProbeFuture<'a> {
        let result = self.get(unit.ordinal);
        Box::pin(async move { result })
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "refresh-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}
