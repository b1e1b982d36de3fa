use std::collections::HashSet;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};

use crate::catalogue::EndpointDescriptor;
use crate::connection::ConnectionHandle;
use crate::prober::{LatencyProber, ProbeResult};

pub struct FastestEndpoint {
    pub endpoint_url: String,
    pub connection: ConnectionHandle,
    pub latency: Duration,
}

/// Races the prober against every live-socket candidate; the first probe
/// that connects wins. Every other connection is closed, including probes
/// that only finish after the winner was picked.
#[derive(Clone)]
pub struct FastestEndpointSelector {
    prober: LatencyProber,
}

impl FastestEndpointSelector {
    pub fn new(prober: LatencyProber) -> Self {
        Self { prober }
    }

    pub fn prober(&self) -> &LatencyProber {
        &self.prober
    }

    /// Performs exactly one race. `None` when no candidate answered in time.
    pub async fn select_fastest(&self, candidates: &[EndpointDescriptor]) -> Option<FastestEndpoint> {
        let mut seen = HashSet::new();
        let urls: Vec<String> = candidates
            .iter()
            .filter(|c| c.is_live_socket())
            .filter(|c| seen.insert(c.url.clone()))
            .map(|c| c.url.clone())
            .collect();
        if urls.is_empty() {
            return None;
        }

        let mut racing: FuturesUnordered<BoxFuture<'static, ProbeResult>> = urls
            .into_iter()
            .map(|url| {
                let prober = self.prober.clone();
                let fut: BoxFuture<'static, ProbeResult> =
                    Box::pin(async move { prober.probe(&url).await });
                fut
            })
            .collect();

        let mut winner = None;
        while let Some(result) = racing.next().await {
            if result.is_success() {
                winner = Some(result);
                break;
            }
            close_loser(result).await;
        }

        if !racing.is_empty() {
            tokio::spawn(async move {
                while let Some(result) = racing.next().await {
                    close_loser(result).await;
                }
            });
        }

        let winner = winner?;
        crate::logging::info_kv(
            "fastest endpoint selected",
            &[
                ("url", &winner.endpoint_url),
                ("latency_ms", &winner.latency.as_millis().to_string()),
            ],
        );
        Some(FastestEndpoint {
            endpoint_url: winner.endpoint_url,
            connection: winner.connection?,
            latency: winner.latency,
        })
    }
}

async fn close_loser(result: ProbeResult) {
    if let Some(conn) = result.connection {
        conn.disconnect().await;
    }
}
