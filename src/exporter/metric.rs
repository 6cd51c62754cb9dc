use anyhow::Context;
use prometheus::{IntCounter, Opts, Registry, TextEncoder};
use std::time::Duration;

use crate::exporter::collector::{LastStatus, LatencySummary, SummarySnapshot};

/// Quantile objectives of the load-time summary as `(quantile, allowed rank error)`.
pub const LATENCY_OBJECTIVES: [(f64, f64); 3] = [(0.5, 0.05), (0.9, 0.01), (0.99, 0.001)];

/// Name, help text and constant `from` label shared by all instruments.
#[derive(Debug, Clone)]
pub struct MetricIdentity {
    pub namespace: String,
    pub subsystem: String,
    pub name: String,
    pub help: String,
    pub origin: String,
}

impl MetricIdentity {
    fn opts(&self, suffix: &str, help: String) -> Opts {
        let name = if suffix.is_empty() {
            self.name.clone()
        } else {
            format!("{}_{}", self.name, suffix)
        };
        Opts::new(name, help)
            .namespace(self.namespace.clone())
            .subsystem(self.subsystem.clone())
            .const_label("from", self.origin.clone())
    }

    /// `namespace_subsystem_name`, the name of the load-time summary.
    pub fn fq_name(&self) -> String {
        self.opts("", self.help.clone()).fq_name()
    }
}

/// Handles written by the probe loop. The registry they were registered
/// with reads them on every scrape.
#[derive(Debug, Clone)]
pub struct Instruments {
    /// Load time of the target in seconds
    latency: LatencySummary,
    /// Last HTTP status code returned by the target
    status: LastStatus,
    /// Probe cycles that ended without an HTTP response
    failures: IntCounter,
}

impl Instruments {
    /// Creates the instruments and registers them with `registry`.
    ///
    /// Fails if a metric name is invalid or already registered.
    pub fn register(registry: &Registry, identity: &MetricIdentity) -> anyhow::Result<Self> {
        let latency = LatencySummary::new(identity.opts("", identity.help.clone()), &LATENCY_OBJECTIVES)
            .with_context(|| format!("invalid metric {}", identity.fq_name()))?;

        let status = LastStatus::new(identity.opts(
            "status_code",
            format!("Last HTTP status code observed by the {} probe", identity.fq_name()),
        ))
        .with_context(|| format!("invalid metric {}_status_code", identity.fq_name()))?;

        let failures = IntCounter::with_opts(identity.opts(
            "failures_total",
            format!("Probe cycles of {} that failed before a response was received", identity.fq_name()),
        ))
        .with_context(|| format!("invalid metric {}_failures_total", identity.fq_name()))?;

        registry
            .register(Box::new(latency.clone()))
            .with_context(|| format!("failed to register metric {}", latency.fq_name()))?;
        registry
            .register(Box::new(status.clone()))
            .with_context(|| format!("failed to register metric {}", status.fq_name()))?;
        registry
            .register(Box::new(failures.clone()))
            .with_context(|| format!("failed to register metric {}_failures_total", identity.fq_name()))?;

        Ok(Self {
            latency,
            status,
            failures,
        })
    }

    /// Records a probe that got an HTTP response, whatever its status.
    pub fn record_success(&self, status: u16, elapsed: Duration) {
        self.latency.observe(elapsed.as_secs_f64());
        self.status.set(status);
    }

    /// Records a probe that failed at the transport level. The summary and
    /// the status gauge are left untouched.
    pub fn record_failure(&self) {
        self.failures.inc();
    }

    pub fn latency_snapshot(&self) -> SummarySnapshot {
        self.latency.snapshot()
    }

    pub fn last_status(&self) -> Option<u16> {
        self.status.get()
    }

    pub fn failures(&self) -> u64 {
        self.failures.get()
    }
}

/// Encodes everything in `registry` in the Prometheus text format.
pub fn gather(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    encoder.encode_to_string(&metric_families).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to encode metrics");
        String::new()
    })
}

/// HTTP server exposing the `/metrics` endpoint
pub mod http_server {
    use super::*;
    use anyhow::Context;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use hyper_util::server::conn::auto::Builder;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info, warn};

    /// A bound metrics listener. Binding happens at startup so a taken port
    /// aborts the process before anything is served.
    #[derive(Debug)]
    pub struct MetricsServer {
        listener: TcpListener,
        local_addr: SocketAddr,
    }

    impl MetricsServer {
        pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
            let local_addr = listener
                .local_addr()
                .context("failed to read metrics listener address")?;

            Ok(Self { listener, local_addr })
        }

        pub fn local_addr(&self) -> SocketAddr {
            self.local_addr
        }

        /// Serves scrapes of `registry` until `shutdown` is cancelled.
        pub async fn serve(self, registry: Arc<Registry>, shutdown: CancellationToken) {
            let addr = self.local_addr();
            info!(%addr, "serving metrics on http://{}/metrics", addr);

            loop {
                tokio::select! {
                    accept_result = self.listener.accept() => {
                        match accept_result {
                            Ok((stream, peer)) => {
                                let registry = registry.clone();

                                tokio::task::spawn(async move {
                                    let io = TokioIo::new(stream);
                                    let service = service_fn(move |req| {
                                        handle_request(req, registry.clone())
                                    });

                                    if let Err(err) = Builder::new(TokioExecutor::new())
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        debug!(%peer, error = %err, "error serving metrics connection");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "failed to accept metrics connection");
                            }
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("metrics server shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
        registry: Arc<Registry>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        // Routed by path alone; hyper drops the body for HEAD.
        match req.uri().path() {
            "/metrics" => {
                let mut response = Response::new(Full::new(Bytes::from(gather(&registry))));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
                Ok(response)
            }
            _ => {
                let mut response = Response::new(Full::new(Bytes::from("Not Found")));
                *response.status_mut() = StatusCode::NOT_FOUND;
                Ok(response)
            }
        }
    }
}
