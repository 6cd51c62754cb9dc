use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::net::UdpSocket;
use tracing::{info, warn};

/// EC2 instance metadata: availability zone of the running instance.
pub const DEFAULT_METADATA_URL: &str =
    "http://169.254.169.254/latest/meta-data/placement/availability-zone";

const METADATA_TIMEOUT: Duration = Duration::from_secs(1);

// Any routable public address works, nothing is sent to it.
const OUTBOUND_ROUTE_TARGET: &str = "8.8.8.8:80";

/// Works out the `from` label: the cloud placement zone if the metadata
/// service answers, otherwise the local address of the outbound route.
#[derive(Debug, Clone)]
pub struct OriginResolver {
    metadata_url: String,
    route_target: String,
}

impl OriginResolver {
    pub fn new(metadata_url: impl Into<String>) -> Self {
        Self {
            metadata_url: metadata_url.into(),
            route_target: OUTBOUND_ROUTE_TARGET.to_string(),
        }
    }

    #[cfg(test)]
    fn with_route_target(mut self, route_target: impl Into<String>) -> Self {
        self.route_target = route_target.into();
        self
    }

    /// Only fails when neither source yields an origin.
    pub async fn resolve(&self) -> anyhow::Result<String> {
        match query_placement(&self.metadata_url).await {
            Ok(zone) => {
                info!(origin = %zone, "resolved origin from placement metadata");
                Ok(zone)
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "placement metadata unavailable, using local outbound address");
                let ip = outbound_local_ip(&self.route_target)
                    .await
                    .context("could not determine an origin label")?;
                info!(origin = %ip, "resolved origin from local outbound address");
                Ok(ip.to_string())
            }
        }
    }
}

async fn query_placement(url: &str) -> anyhow::Result<String> {
    // The metadata service is link-local and never sits behind a proxy.
    let client = reqwest::Client::builder()
        .timeout(METADATA_TIMEOUT)
        .no_proxy()
        .build()
        .context("failed to build metadata client")?;

    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to query {url}"))?
        .error_for_status()?;
    let body = response
        .text()
        .await
        .with_context(|| format!("failed to read response from {url}"))?;

    let zone = body.trim();
    if zone.is_empty() {
        bail!("{url} returned an empty placement");
    }
    Ok(zone.to_string())
}

/// Local address the OS would pick to reach `route_target`. A connected UDP
/// socket only selects a route; no packet leaves the host.
pub(crate) async fn outbound_local_ip(route_target: &str) -> anyhow::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind UDP socket")?;
    socket
        .connect(route_target)
        .await
        .with_context(|| format!("no route to {route_target}"))?;

    let ip = socket
        .local_addr()
        .context("failed to read local socket address")?
        .ip();
    if ip.is_unspecified() {
        return Err(anyhow!("route to {route_target} has no local address"));
    }
    Ok(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{refused_addr, spawn_silent_target, spawn_target_with_body};
    use std::net::Ipv4Addr;
    use tokio::time::Instant;

    #[tokio::test]
    async fn placement_body_becomes_the_origin() {
        let metadata = spawn_target_with_body(200, Duration::ZERO, "eu-west-1a\n").await;
        let origin = OriginResolver::new(format!("http://{metadata}/latest/meta-data/placement/availability-zone"))
            .resolve()
            .await
            .unwrap();
        assert_eq!(origin, "eu-west-1a");
    }

    #[tokio::test]
    async fn metadata_timeout_falls_back_to_local_address() {
        let metadata = spawn_silent_target().await;
        let started = Instant::now();

        let origin = OriginResolver::new(format!("http://{metadata}/"))
            .with_route_target("127.0.0.1:9")
            .resolve()
            .await
            .unwrap();

        assert_eq!(origin, "127.0.0.1");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn metadata_error_status_falls_back_to_local_address() {
        let metadata = spawn_target_with_body(404, Duration::ZERO, "not found").await;
        let origin = OriginResolver::new(format!("http://{metadata}/"))
            .with_route_target("127.0.0.1:9")
            .resolve()
            .await
            .unwrap();
        assert_eq!(origin, "127.0.0.1");
    }

    #[tokio::test]
    async fn refused_metadata_falls_back_to_local_address() {
        let metadata = refused_addr().await;
        let origin = OriginResolver::new(format!("http://{metadata}/"))
            .with_route_target("127.0.0.1:9")
            .resolve()
            .await
            .unwrap();
        assert!(!origin.is_empty());
        assert_eq!(origin.parse::<IpAddr>().unwrap(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn loopback_route_uses_loopback_address() {
        let ip = outbound_local_ip("127.0.0.1:9").await.unwrap();
        assert!(ip.is_loopback());
    }

    #[tokio::test]
    async fn no_usable_route_is_fatal() {
        let err = outbound_local_ip("[::1]:9").await.unwrap_err();
        assert!(format!("{err:#}").contains("no route to [::1]:9"), "{err:#}");

        let metadata = refused_addr().await;
        let err = OriginResolver::new(format!("http://{metadata}/"))
            .with_route_target("[::1]:9")
            .resolve()
            .await
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.starts_with("could not determine an origin label"), "{message}");
        assert!(message.contains("no route to [::1]:9"), "{message}");
    }
}
