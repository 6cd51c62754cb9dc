use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::exporter::MetricIdentity;
use crate::network::DEFAULT_METADATA_URL;

const DEFAULT_URL: &str = "https://example.com/";
const DEFAULT_SUBSYSTEM: &str = "website";
const DEFAULT_METRIC_NAME: &str = "load_time";
const DEFAULT_METRIC_HELP: &str = "Website load time in seconds";

#[derive(Parser, Debug)]
#[command(
    version,
    about = "HttpWatch - probes an HTTP endpoint and exports its load time as Prometheus metrics"
)]
pub struct Args {
    /// Port the /metrics endpoint listens on
    #[arg(long = "scrapePort", env = "scrapePort", default_value_t = 9100)]
    pub scrape_port: u16,

    /// Seconds to wait after each probe before the next one
    #[arg(
        long = "monitorInterval",
        env = "monitorInterval",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub monitor_interval: u64,

    /// URL to probe (env fallback: monitorUrl)
    #[arg(long = "url", visible_alias = "monitorUrl", env = "url")]
    pub url: Option<String>,

    /// Metric namespace
    #[arg(long, env = "namespace", default_value = "monitoring")]
    pub namespace: String,

    /// Metric subsystem, e.g. server or website
    #[arg(long, env = "subsystem")]
    pub subsystem: Option<String>,

    /// Name of the published metric (env fallback: componentName)
    #[arg(long = "metricName", visible_alias = "componentName", env = "metricName")]
    pub metric_name: Option<String>,

    /// Help text of the published metric
    #[arg(long = "metricHelp", env = "metricHelp")]
    pub metric_help: Option<String>,

    /// Cloud metadata URL answering with the placement zone
    #[arg(long = "metadataUrl", env = "metadataUrl", default_value = DEFAULT_METADATA_URL)]
    pub metadata_url: String,

    /// Fixed value for the `from` label, skips origin resolution
    #[arg(long, env = "origin")]
    pub origin: Option<String>,

    /// Per-probe deadline in seconds, the HTTP client default applies when unset
    #[arg(
        long = "probeTimeout",
        env = "probeTimeout",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub probe_timeout: Option<u64>,

    /// Refuse to start with built-in defaults for url, subsystem, metricName and metricHelp
    #[arg(long, env = "strict", value_parser = clap::builder::BoolishValueParser::new())]
    pub strict: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    MissingKeys(Vec<&'static str>),
    #[error("{0} must not be empty")]
    EmptyValue(&'static str),
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Settings fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub url: String,
    pub interval: Duration,
    pub scrape_port: u16,
    pub namespace: String,
    pub subsystem: String,
    pub metric_name: String,
    pub metric_help: String,
    pub metadata_url: String,
    pub origin: Option<String>,
    pub probe_timeout: Option<Duration>,
}

impl MonitorConfig {
    /// Builds the config from parsed flags. `lookup_env` resolves the
    /// alternative variable names (`monitorUrl`, `componentName`) that clap
    /// does not read itself.
    pub fn from_args<F>(args: Args, lookup_env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let url = non_empty(args.url).or_else(|| non_empty(lookup_env("monitorUrl")));
        let subsystem = non_empty(args.subsystem);
        let metric_name = non_empty(args.metric_name).or_else(|| non_empty(lookup_env("componentName")));
        let metric_help = non_empty(args.metric_help);

        let (url, subsystem, metric_name, metric_help) = if args.strict {
            let mut missing = Vec::new();
            for (key, value) in [
                ("url", &url),
                ("subsystem", &subsystem),
                ("metricName", &metric_name),
                ("metricHelp", &metric_help),
            ] {
                if value.is_none() {
                    missing.push(key);
                }
            }
            match (url, subsystem, metric_name, metric_help) {
                (Some(url), Some(subsystem), Some(metric_name), Some(metric_help)) => {
                    (url, subsystem, metric_name, metric_help)
                }
                _ => return Err(ConfigError::MissingKeys(missing)),
            }
        } else {
            (
                url.unwrap_or_else(|| DEFAULT_URL.to_string()),
                subsystem.unwrap_or_else(|| DEFAULT_SUBSYSTEM.to_string()),
                metric_name.unwrap_or_else(|| DEFAULT_METRIC_NAME.to_string()),
                metric_help.unwrap_or_else(|| DEFAULT_METRIC_HELP.to_string()),
            )
        };

        if args.namespace.trim().is_empty() {
            return Err(ConfigError::EmptyValue("namespace"));
        }
        if args.metadata_url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("metadataUrl"));
        }
        validate_url(&url)?;

        Ok(Self {
            url,
            interval: Duration::from_secs(args.monitor_interval),
            scrape_port: args.scrape_port,
            namespace: args.namespace,
            subsystem,
            metric_name,
            metric_help,
            metadata_url: args.metadata_url,
            origin: non_empty(args.origin),
            probe_timeout: args.probe_timeout.map(Duration::from_secs),
        })
    }

    pub fn identity(&self, origin: String) -> MetricIdentity {
        MetricIdentity {
            namespace: self.namespace.clone(),
            subsystem: self.subsystem.clone(),
            name: self.metric_name.clone(),
            help: self.metric_help.clone(),
            origin,
        }
    }
}

fn validate_url(url: &str) -> Result<(), ConfigError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {scheme}"),
        }),
    }
}
