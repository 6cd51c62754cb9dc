use prometheus::core::{Collector, Desc};
use prometheus::proto::{self, MetricFamily, MetricType};
use prometheus::Opts;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::exporter::quantile::QuantileStream;

fn describe(opts: &Opts) -> prometheus::Result<Desc> {
    Desc::new(
        opts.fq_name(),
        opts.help.clone(),
        Vec::new(),
        opts.const_labels.clone(),
    )
}

fn single_metric_family(desc: &Desc, field_type: MetricType, mut metric: proto::Metric) -> MetricFamily {
    for pair in &desc.const_label_pairs {
        metric.mut_label().push(pair.clone());
    }

    let mut family = MetricFamily::default();
    family.set_name(desc.fq_name.clone());
    family.set_help(desc.help.clone());
    family.set_field_type(field_type);
    family.mut_metric().push(metric);
    family
}

/// Point-in-time view of a [`LatencySummary`].
#[derive(Debug, Clone, PartialEq)]
pub struct SummarySnapshot {
    pub quantiles: Vec<(f64, f64)>,
    pub sum: f64,
    pub count: u64,
}

struct SummaryCore {
    stream: QuantileStream,
    sum: f64,
    count: u64,
}

struct SummaryInner {
    desc: Desc,
    objectives: Vec<(f64, f64)>,
    core: Mutex<SummaryCore>,
}

/// Summary metric with quantile objectives and no age-out: every observation
/// stays in the (compressed) stream for the life of the process.
///
/// Observation and collection share one lock, so a scrape always sees
/// quantiles, `_sum` and `_count` from the same set of observations.
#[derive(Clone)]
pub struct LatencySummary {
    inner: Arc<SummaryInner>,
}

impl LatencySummary {
    pub fn new(opts: Opts, objectives: &[(f64, f64)]) -> prometheus::Result<Self> {
        let desc = describe(&opts)?;
        Ok(Self {
            inner: Arc::new(SummaryInner {
                desc,
                objectives: objectives.to_vec(),
                core: Mutex::new(SummaryCore {
                    stream: QuantileStream::new(objectives),
                    sum: 0.0,
                    count: 0,
                }),
            }),
        })
    }

    pub fn observe(&self, value: f64) {
        let mut core = self.inner.core.lock().unwrap_or_else(PoisonError::into_inner);
        core.stream.insert(value);
        core.sum += value;
        core.count += 1;
    }

    pub fn snapshot(&self) -> SummarySnapshot {
        let mut core = self.inner.core.lock().unwrap_or_else(PoisonError::into_inner);
        let quantiles = self
            .inner
            .objectives
            .iter()
            .map(|&(q, _)| (q, core.stream.query(q)))
            .collect();

        SummarySnapshot {
            quantiles,
            sum: core.sum,
            count: core.count,
        }
    }

    pub fn fq_name(&self) -> &str {
        &self.inner.desc.fq_name
    }
}

impl std::fmt::Debug for LatencySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencySummary")
            .field("name", &self.inner.desc.fq_name)
            .field("objectives", &self.inner.objectives)
            .finish()
    }
}

impl Collector for LatencySummary {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.inner.desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let snapshot = self.snapshot();

        let mut summary = proto::Summary::default();
        summary.set_sample_count(snapshot.count);
        summary.set_sample_sum(snapshot.sum);
        for (q, value) in snapshot.quantiles {
            let mut quantile = proto::Quantile::default();
            quantile.set_quantile(q);
            quantile.set_value(value);
            summary.mut_quantile().push(quantile);
        }

        let mut metric = proto::Metric::default();
        metric.set_summary(summary);

        vec![single_metric_family(&self.inner.desc, MetricType::SUMMARY, metric)]
    }
}

/// Gauge holding the last HTTP status code. Nothing is exposed until the
/// first value is set.
#[derive(Debug, Clone)]
pub struct LastStatus {
    desc: Arc<Desc>,
    // 0 means "not observed yet"; HTTP status codes start at 100.
    code: Arc<AtomicU32>,
}

impl LastStatus {
    pub fn new(opts: Opts) -> prometheus::Result<Self> {
        Ok(Self {
            desc: Arc::new(describe(&opts)?),
            code: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn set(&self, status: u16) {
        self.code.store(u32::from(status), Ordering::Relaxed);
    }

    pub fn get(&self) -> Option<u16> {
        match self.code.load(Ordering::Relaxed) {
            0 => None,
            code => u16::try_from(code).ok(),
        }
    }

    pub fn fq_name(&self) -> &str {
        &self.desc.fq_name
    }
}

impl Collector for LastStatus {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let Some(status) = self.get() else {
            return Vec::new();
        };

        let mut gauge = proto::Gauge::default();
        gauge.set_value(f64::from(status));

        let mut metric = proto::Metric::default();
        metric.set_gauge(gauge);

        vec![single_metric_family(&self.desc, MetricType::GAUGE, metric)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Registry, TextEncoder};

    const OBJECTIVES: [(f64, f64); 3] = [(0.5, 0.05), (0.9, 0.01), (0.99, 0.001)];

    fn opts(name: &str) -> Opts {
        Opts::new(name, "test help")
            .namespace("monitoring")
            .subsystem("website")
            .const_label("from", "eu-west-1a")
    }

    fn encode(registry: &Registry) -> String {
        TextEncoder::new()
            .encode_to_string(&registry.gather())
            .unwrap()
    }

    #[test]
    fn summary_exposes_quantiles_sum_and_count() {
        let registry = Registry::new();
        let summary = LatencySummary::new(opts("load_time"), &OBJECTIVES).unwrap();
        registry.register(Box::new(summary.clone())).unwrap();

        summary.observe(0.25);
        summary.observe(0.75);

        let text = encode(&registry);
        assert!(text.contains("# TYPE monitoring_website_load_time summary"), "{text}");
        assert!(text.contains("# HELP monitoring_website_load_time test help"), "{text}");
        for q in ["0.5", "0.9", "0.99"] {
            let line = format!("monitoring_website_load_time{{from=\"eu-west-1a\",quantile=\"{q}\"}}");
            assert!(text.contains(&line), "missing {line} in {text}");
        }
        assert!(text.contains("monitoring_website_load_time_sum{from=\"eu-west-1a\"} 1"), "{text}");
        assert!(text.contains("monitoring_website_load_time_count{from=\"eu-west-1a\"} 2"), "{text}");
    }

    #[test]
    fn empty_summary_reports_nan_quantiles() {
        let summary = LatencySummary::new(opts("load_time"), &OBJECTIVES).unwrap();
        let snapshot = summary.snapshot();
        assert_eq!(snapshot.count, 0);
        assert_eq!(snapshot.sum, 0.0);
        assert_eq!(snapshot.quantiles.len(), 3);
        assert!(snapshot.quantiles.iter().all(|(_, v)| v.is_nan()));
    }

    #[test]
    fn last_status_is_absent_until_set() {
        let registry = Registry::new();
        let status = LastStatus::new(opts("load_time_status_code")).unwrap();
        registry.register(Box::new(status.clone())).unwrap();

        assert_eq!(status.get(), None);
        assert!(!encode(&registry).contains("load_time_status_code{"));

        status.set(404);
        status.set(200);
        assert_eq!(status.get(), Some(200));
        let text = encode(&registry);
        assert!(text.contains("# TYPE monitoring_website_load_time_status_code gauge"), "{text}");
        assert!(
            text.contains("monitoring_website_load_time_status_code{from=\"eu-west-1a\"} 200"),
            "{text}"
        );
    }

    #[test]
    fn invalid_metric_name_is_rejected() {
        assert!(LatencySummary::new(opts("load-time"), &OBJECTIVES).is_err());
        assert!(LastStatus::new(opts("load time")).is_err());
    }
}
