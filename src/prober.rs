use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::connection::{ConnectionHandle, Connector};
use crate::telemetry::ConnectionStats;

/// Latency reported for endpoints that failed or did not answer in time.
pub const WORST_CASE_DELAY: Duration = Duration::from_secs(5);

pub struct ProbeResult {
    pub endpoint_url: String,
    pub connection: Option<ConnectionHandle>,
    pub latency: Duration,
    /// The liveness call returned before the deadline fired.
    pub answered: bool,
}

impl ProbeResult {
    pub fn is_success(&self) -> bool {
        self.answered && self.connection.is_some()
    }
}

impl std::fmt::Debug for ProbeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeResult")
            .field("endpoint_url", &self.endpoint_url)
            .field("connected", &self.connection.is_some())
            .field("latency", &self.latency)
            .field("answered", &self.answered)
            .finish()
    }
}

/// Opens a throwaway connection and times one liveness round trip.
///
/// Never fails: errors and timeouts come back as [`WORST_CASE_DELAY`] (or the
/// configured equivalent) so a slow endpoint sorts last. The caller owns any
/// returned connection and decides whether to keep or close it.
#[derive(Clone)]
pub struct LatencyProber {
    connector: Arc<dyn Connector>,
    worst_case: Duration,
    stats: Arc<ConnectionStats>,
}

impl LatencyProber {
    pub fn new(connector: Arc<dyn Connector>, worst_case: Duration, stats: Arc<ConnectionStats>) -> Self {
        Self {
            connector,
            worst_case,
            stats,
        }
    }

    pub fn worst_case(&self) -> Duration {
        self.worst_case
    }

    pub async fn probe(&self, endpoint_url: &str) -> ProbeResult {
        self.stats.on_probe();
        let start = Instant::now();
        let failed = |connection: Option<ConnectionHandle>| ProbeResult {
            endpoint_url: endpoint_url.to_string(),
            connection,
            latency: self.worst_case,
            answered: false,
        };

        let connection = match timeout(self.worst_case, self.connector.dial(endpoint_url)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => {
                self.stats.on_dial_failure(format!("{err:#}"));
                crate::logging::warn_kv(
                    "probe dial failed",
                    &[("url", endpoint_url), ("err", &format!("{err:#}"))],
                );
                return failed(None);
            }
            Err(_) => {
                self.stats.on_probe_timeout();
                return failed(None);
            }
        };

        let remaining = self.worst_case.saturating_sub(start.elapsed());
        match timeout(remaining, connection.liveness()).await {
            Ok(Ok(_)) => {
                let latency = start.elapsed().min(self.worst_case);
                ProbeResult {
                    endpoint_url: endpoint_url.to_string(),
                    connection: Some(connection),
                    latency,
                    answered: true,
                }
            }
            Ok(Err(err)) => {
                crate::logging::warn_kv(
                    "probe liveness failed",
                    &[("url", endpoint_url), ("err", &format!("{err:#}"))],
                );
                failed(Some(connection))
            }
            Err(_) => {
                self.stats.on_probe_timeout();
                failed(Some(connection))
            }
        }
    }
}
