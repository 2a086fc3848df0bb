use chrono::{DateTime, Local, Utc};

use crate::k8s::FailureKind;
use crate::model::{ContainerStats, MetricSample, ResourceLimits};

pub const UNAUTHORIZED: &str = "unauthorized";
pub const UNAVAILABLE: &str = "unavailable";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SeriesStyle {
    Primary,
    Secondary,
    Limit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: &'static str,
    pub style: SeriesStyle,
    pub points: Vec<(String, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Graph {
    Loading,
    Series(Vec<Series>),
    Notice(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Graphs {
    pub memory: Graph,
    pub cpu: Graph,
    pub network: Graph,
}

impl Default for Graphs {
    fn default() -> Self {
        Self::notice("no pod selected")
    }
}

impl Graphs {
    pub fn loading() -> Self {
        Self {
            memory: Graph::Loading,
            cpu: Graph::Loading,
            network: Graph::Loading,
        }
    }

    pub fn notice(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            memory: Graph::Notice(text.clone()),
            cpu: Graph::Notice(text.clone()),
            network: Graph::Notice(text),
        }
    }

    // `limits` are the ones declared in the pod for this container.
    pub fn from_stats(stats: &ContainerStats, limits: ResourceLimits) -> Self {
        Self {
            memory: memory_graph(stats, limits),
            cpu: cpu_graph(stats, limits),
            network: network_graph(stats),
        }
    }
}

fn label(timestamp: DateTime<Utc>) -> String {
    timestamp.with_timezone(&Local).format("%H:%M:%S").to_string()
}

fn series_of(
    name: &'static str,
    style: SeriesStyle,
    samples: &[MetricSample],
    value: impl Fn(&MetricSample) -> f64,
) -> Series {
    Series {
        name,
        style,
        points: samples
            .iter()
            .map(|sample| (label(sample.timestamp), value(sample)))
            .collect(),
    }
}

fn constant(name: &'static str, like: &Series, value: f64) -> Series {
    Series {
        name,
        style: SeriesStyle::Limit,
        points: like
            .points
            .iter()
            .map(|(label, _)| (label.clone(), value))
            .collect(),
    }
}

fn memory_graph(stats: &ContainerStats, limits: ResourceLimits) -> Graph {
    let usage = series_of("usage", SeriesStyle::Primary, &stats.samples, |sample| {
        sample.memory_usage as f64
    });
    let cache = series_of("cache", SeriesStyle::Secondary, &stats.samples, |sample| {
        sample.memory_cache as f64
    });

    let limit = limits
        .memory_bytes
        .map(|declared| stats.spec.memory_limit.unwrap_or(declared))
        .map(|limit| constant("limit", &usage, limit as f64));

    let mut series = vec![usage, cache];
    series.extend(limit);
    Graph::Series(series)
}

/// Millicore-equivalent rates between consecutive cumulative nanosecond
/// counters, normalized by the real spacing of the samples.
pub fn cpu_rates(samples: &[(DateTime<Utc>, u64)]) -> Vec<f64> {
    samples
        .windows(2)
        .map(|pair| {
            let (previous_at, previous) = pair[0];
            let (at, current) = pair[1];
            let seconds = (at - previous_at).num_milliseconds() as f64 / 1_000.0;
            if seconds <= 0.0 {
                return 0.0;
            }
            current.saturating_sub(previous) as f64 / 1e6 / seconds
        })
        .collect()
}

fn cpu_series(
    name: &'static str,
    style: SeriesStyle,
    samples: &[MetricSample],
    counter: fn(&MetricSample) -> u64,
) -> Series {
    let counters = samples
        .iter()
        .map(|sample| (sample.timestamp, counter(sample)))
        .collect::<Vec<_>>();
    Series {
        name,
        style,
        points: samples
            .iter()
            .skip(1)
            .map(|sample| label(sample.timestamp))
            .zip(cpu_rates(&counters))
            .collect(),
    }
}

fn cpu_graph(stats: &ContainerStats, limits: ResourceLimits) -> Graph {
    let total = cpu_series("total", SeriesStyle::Primary, &stats.samples, |sample| {
        sample.cpu_total
    });
    let user = cpu_series("user", SeriesStyle::Secondary, &stats.samples, |sample| {
        sample.cpu_user
    });

    let from_spec = match (stats.spec.cpu_quota, stats.spec.cpu_period) {
        (Some(quota), Some(period)) if period > 0 => Some(quota as f64 / period as f64 * 1_000.0),
        _ => None,
    };
    let limit = limits
        .cpu_millicores
        .map(|declared| from_spec.unwrap_or(declared as f64))
        .map(|limit| constant("limit", &total, limit));

    let mut series = vec![total, user];
    series.extend(limit);
    Graph::Series(series)
}

fn network_graph(stats: &ContainerStats) -> Graph {
    if !stats.spec.has_network {
        return Graph::Notice(UNAVAILABLE.to_string());
    }

    let samples = stats
        .samples
        .iter()
        .filter(|sample| sample.network.is_some())
        .cloned()
        .collect::<Vec<_>>();
    let rx = series_of("rx", SeriesStyle::Primary, &samples, |sample| {
        sample.network.map(|network| network.rx_bytes).unwrap_or_default() as f64
    });
    let tx = series_of("tx", SeriesStyle::Secondary, &samples, |sample| {
        sample.network.map(|network| network.tx_bytes).unwrap_or_default() as f64
    });
    Graph::Series(vec![rx, tx])
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PollFailure {
    Show(&'static str),
    StopSilently,
    LogOnly,
}

pub fn poll_failure(kind: FailureKind) -> PollFailure {
    match kind {
        FailureKind::Unauthorized => PollFailure::Show(UNAUTHORIZED),
        FailureKind::NotFound => PollFailure::StopSilently,
        FailureKind::Http(_) => PollFailure::Show(UNAVAILABLE),
        FailureKind::Other => PollFailure::LogOnly,
    }
}
