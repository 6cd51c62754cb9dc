use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::exporter::Instruments;

/// Result of a probe that received an HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub status: u16,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} timed out after {timeout:?}")]
    TimedOut { url: String, timeout: Duration },
    #[error("probe cancelled")]
    Cancelled,
}

/// Probes one URL on a fixed delay and records into [`Instruments`].
#[derive(Debug)]
pub struct Monitor {
    client: reqwest::Client,
    url: String,
    interval: Duration,
    probe_timeout: Option<Duration>,
    instruments: Arc<Instruments>,
}

impl Monitor {
    pub fn new(
        client: reqwest::Client,
        url: String,
        interval: Duration,
        instruments: Arc<Instruments>,
    ) -> Self {
        Self {
            client,
            url,
            interval,
            probe_timeout: None,
            instruments,
        }
    }

    /// Puts a deadline on each request. Without one the client's own timeout applies.
    pub fn with_probe_timeout(mut self, probe_timeout: Option<Duration>) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Runs one probe cycle without the trailing sleep.
    ///
    /// Any HTTP response counts as a measurement, 4xx and 5xx included. Only
    /// failures to get a response at all are errors; those bump the failure
    /// counter and leave the summary and status gauge alone.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> Result<ProbeOutcome, ProbeError> {
        let start = Instant::now();

        let result = tokio::select! {
            _ = shutdown.cancelled() => return Err(ProbeError::Cancelled),
            result = self.fetch() => result,
        };

        match result {
            Ok(status) => {
                let elapsed = start.elapsed();
                self.instruments.record_success(status, elapsed);
                info!(status, elapsed = elapsed.as_secs_f64(), url = %self.url, "probe completed");
                Ok(ProbeOutcome { status, elapsed })
            }
            Err(err) => {
                self.instruments.record_failure();
                warn!(error = %err, "probe failed, skipping this cycle");
                Err(err)
            }
        }
    }

    async fn fetch(&self) -> Result<u16, ProbeError> {
        let request = self.client.get(&self.url).send();
        let response = match self.probe_timeout {
            Some(timeout) => tokio::time::timeout(timeout, request)
                .await
                .map_err(|_| ProbeError::TimedOut {
                    url: self.url.clone(),
                    timeout,
                })?,
            None => request.await,
        };

        response
            .map(|response| response.status().as_u16())
            .map_err(|source| ProbeError::Transport {
                url: self.url.clone(),
                source,
            })
    }

    /// Probes forever with a fixed delay of `interval` after every cycle,
    /// until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(url = %self.url, interval = ?self.interval, "starting probe loop");

        loop {
            if let Err(ProbeError::Cancelled) = self.run_cycle(&shutdown).await {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(
            url = %self.url,
            probes = self.instruments.latency_snapshot().count,
            failures = self.instruments.failures(),
            last_status = ?self.instruments.last_status(),
            "probe loop stopped"
        );
    }
}

pub fn spawn_monitor(monitor: Monitor, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(monitor.run(shutdown))
}
