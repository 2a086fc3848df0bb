use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use futures::channel::mpsc as stream_channel;
use futures::stream::BoxStream;
use futures::{SinkExt, Stream, StreamExt};
use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{
    AttachParams, GetParams, ListParams, LogParams, TerminalSize, WatchEvent, WatchParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use serde::Deserialize;
use std::fmt::{Display, Formatter};
use std::pin::pin;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::{
    ContainerInfo, ContainerStats, MetricSample, NetworkSample, PodEvent, PodList, PodRecord,
    ResourceLimits, StatsSpec, StatsTarget, WatchKind,
};
use crate::task::{Pending, next_or_cancelled};

pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;
pub type PodEventStream = BoxStream<'static, Result<PodEvent>>;

const WATCH_TIMEOUT_SECS: u32 = 290;
const STREAM_BUFFER: usize = 64;
const HTTP_GONE: u16 = 410;

/// Read and exec access to one cluster. Every call hands back a pending
/// operation carrying its own cancellation handle.
pub trait ClusterClient: Send + Sync + 'static {
    fn get_pods(&self, namespace: &str) -> Pending<PodList>;
    fn watch_pods(&self, namespace: &str, resource_version: &str) -> Pending<PodEventStream>;
    fn watch_pod(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
    ) -> Pending<PodEventStream>;
    fn get_pod(&self, namespace: &str, name: &str) -> Pending<PodRecord>;
    fn follow_log(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        since_time: Option<&str>,
    ) -> Pending<ByteStream>;
    fn container_stats(&self, target: &StatsTarget) -> Pending<ContainerStats>;
    fn exec(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        command: &[String],
    ) -> Pending<ExecChannel>;
}

// `output` closes when the remote process exits or the cancel handle fires.
pub struct ExecChannel {
    pub output: mpsc::Receiver<Vec<u8>>,
    pub input: mpsc::Sender<Vec<u8>>,
    pub resize: mpsc::Sender<(u16, u16)>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FailureKind {
    NotFound,
    Unauthorized,
    Http(u16),
    Other,
}

/// An HTTP status surfaced without a kube client error, e.g. a watch
/// stream's in-band error object.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HttpFailure {
    pub code: u16,
    pub message: String,
}

impl Display for HttpFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP {}: {}", self.code, self.message)
    }
}

impl std::error::Error for HttpFailure {}

pub fn classify(error: &anyhow::Error) -> FailureKind {
    for cause in error.chain() {
        let code = if let Some(kube::Error::Api(response)) = cause.downcast_ref::<kube::Error>() {
            Some(response.code)
        } else {
            cause
                .downcast_ref::<HttpFailure>()
                .map(|failure| failure.code)
        };

        if let Some(code) = code {
            return match code {
                404 => FailureKind::NotFound,
                401 | 403 => FailureKind::Unauthorized,
                code => FailureKind::Http(code),
            };
        }
    }
    FailureKind::Other
}

pub fn compact_error(error: &anyhow::Error) -> String {
    let mut out = Vec::new();
    for (index, cause) in error.chain().enumerate() {
        if index == 0 {
            out.push(cause.to_string());
        } else if index <= 2 {
            out.push(format!("caused by: {cause}"));
        } else {
            break;
        }
    }

    out.join("\n")
}

#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    context: String,
    cluster: String,
    default_namespace: String,
}

impl KubeGateway {
    pub async fn new(context: Option<String>) -> Result<Self> {
        let kubeconfig = Kubeconfig::read().ok();

        let config = if let Some(kubeconfig_value) = kubeconfig.clone() {
            let options = KubeConfigOptions {
                context: context.clone(),
                cluster: None,
                user: None,
            };
            Config::from_custom_kubeconfig(kubeconfig_value, &options)
                .await
                .context("failed to infer Kubernetes configuration")?
        } else {
            if context.is_some() {
                anyhow::bail!("kubeconfig not found; --context is unavailable in this environment");
            }
            Config::infer()
                .await
                .context("failed to infer Kubernetes configuration")?
        };

        let cluster = config.cluster_url.to_string();
        let default_namespace = config.default_namespace.clone();
        let client = Client::try_from(config).context("failed to initialize Kubernetes client")?;

        let context = context
            .or_else(|| {
                kubeconfig
                    .as_ref()
                    .and_then(|cfg| cfg.current_context.clone())
            })
            .unwrap_or_else(|| "in-cluster".to_string());

        Ok(Self {
            client,
            context,
            cluster,
            default_namespace,
        })
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn watch_with(
        &self,
        namespace: &str,
        params: WatchParams,
        resource_version: &str,
    ) -> Pending<PodEventStream> {
        let api = self.pods(namespace);
        let version = resource_version.to_string();
        let label = namespace.to_string();
        let cancel = CancellationToken::new();
        let pump_cancel = cancel.clone();

        Pending::with_cancel(
            async move {
                let (tx, rx) = stream_channel::channel(STREAM_BUFFER);
                let (ready_tx, ready_rx) = oneshot::channel();
                tokio::spawn(async move {
                    let events = match api.watch(&params, &version).await {
                        Ok(events) => {
                            let _ = ready_tx.send(Ok(()));
                            events
                        }
                        Err(error) => {
                            let _ = ready_tx.send(Err(error));
                            return;
                        }
                    };
                    let events = events
                        .map(|event| event.map_err(anyhow::Error::from))
                        .filter_map(|event| futures::future::ready(translate_watch_event(event)));
                    forward(events, tx, pump_cancel).await;
                });

                ready_rx
                    .await
                    .context("watch task ended before the stream opened")?
                    .with_context(|| format!("failed to watch pods in {label}"))?;
                Ok(rx.boxed())
            },
            cancel,
        )
    }
}

impl ClusterClient for KubeGateway {
    fn get_pods(&self, namespace: &str) -> Pending<PodList> {
        let api = self.pods(namespace);
        let namespace = namespace.to_string();
        Pending::new(async move {
            let list = api
                .list(&ListParams::default())
                .await
                .with_context(|| format!("failed to list pods in {namespace}"))?;
            Ok(PodList {
                resource_version: list.metadata.resource_version.clone().unwrap_or_default(),
                items: list.items.into_iter().map(pod_record).collect(),
            })
        })
    }

    fn watch_pods(&self, namespace: &str, resource_version: &str) -> Pending<PodEventStream> {
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        self.watch_with(namespace, params, resource_version)
    }

    fn watch_pod(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
    ) -> Pending<PodEventStream> {
        let params = WatchParams::default()
            .fields(&format!("metadata.name={name}"))
            .timeout(WATCH_TIMEOUT_SECS);
        self.watch_with(namespace, params, resource_version)
    }

    fn get_pod(&self, namespace: &str, name: &str) -> Pending<PodRecord> {
        let api = self.pods(namespace);
        let target = format!("{namespace}/{name}");
        let name = name.to_string();
        Pending::new(async move {
            let pod = api
                .get(&name)
                .await
                .with_context(|| format!("failed to load pod {target}"))?;
            Ok(pod_record(pod))
        })
    }

    fn follow_log(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        since_time: Option<&str>,
    ) -> Pending<ByteStream> {
        let api = self.pods(namespace);
        let target = format!("{namespace}/{name}/{container}");
        let name = name.to_string();
        let container = container.to_string();
        let since_time = since_time.map(str::to_string);
        let cancel = CancellationToken::new();
        let pump_cancel = cancel.clone();

        Pending::with_cancel(
            async move {
                let since_time = since_time
                    .map(|value| {
                        value
                            .parse::<k8s_openapi::jiff::Timestamp>()
                            .with_context(|| format!("invalid log resume timestamp {value}"))
                    })
                    .transpose()?;
                let params = LogParams {
                    container: Some(container),
                    follow: true,
                    timestamps: true,
                    since_time,
                    ..LogParams::default()
                };

                let (tx, rx) = stream_channel::channel(STREAM_BUFFER);
                let (ready_tx, ready_rx) = oneshot::channel();
                tokio::spawn(async move {
                    let reader = match api.log_stream(&name, &params).await {
                        Ok(reader) => {
                            let _ = ready_tx.send(Ok(()));
                            reader
                        }
                        Err(error) => {
                            let _ = ready_tx.send(Err(error));
                            return;
                        }
                    };
                    let chunks = ReaderStream::new(reader.compat()).map(|chunk| {
                        chunk
                            .map(|bytes| bytes.to_vec())
                            .map_err(anyhow::Error::from)
                    });
                    forward(chunks, tx, pump_cancel).await;
                });

                ready_rx
                    .await
                    .context("log task ended before the stream opened")?
                    .with_context(|| format!("failed to follow logs for {target}"))?;
                Ok(rx.boxed())
            },
            cancel,
        )
    }

    fn container_stats(&self, target: &StatsTarget) -> Pending<ContainerStats> {
        let client = self.client.clone();
        let target = target.clone();
        Pending::new(async move {
            let path = format!(
                "/api/v1/nodes/{}/proxy/stats/{}/{}/{}",
                target.node, target.namespace, target.pod, target.uid
            );
            let request = kube::core::Request::new(path)
                .get(&target.container, &GetParams::default())
                .context("failed to build container stats request")?;
            let raw: RawContainerInfo = client.request(request).await.with_context(|| {
                format!(
                    "failed to load stats for {}/{}/{}",
                    target.namespace, target.pod, target.container
                )
            })?;
            Ok(container_stats_from_raw(raw))
        })
    }

    fn exec(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        command: &[String],
    ) -> Pending<ExecChannel> {
        let api = self.pods(namespace);
        let target = format!("{namespace}/{name}/{container}");
        let name = name.to_string();
        let params = AttachParams::interactive_tty().container(container);
        let command = command.to_vec();
        let cancel = CancellationToken::new();
        let session_cancel = cancel.clone();

        Pending::with_cancel(
            async move {
                let mut attached = api
                    .exec(&name, command, &params)
                    .await
                    .with_context(|| format!("failed to open shell in {target}"))?;
                let stdout = attached
                    .stdout()
                    .context("shell session has no output stream")?;
                let mut stdin = attached
                    .stdin()
                    .context("shell session has no input stream")?;
                let mut size_tx = attached.terminal_size();

                let (output_tx, output) = mpsc::channel::<Vec<u8>>(STREAM_BUFFER);
                let (input, mut input_rx) = mpsc::channel::<Vec<u8>>(STREAM_BUFFER);
                let (resize, mut resize_rx) = mpsc::channel::<(u16, u16)>(4);

                tokio::spawn(async move {
                    let mut chunks = ReaderStream::new(stdout);
                    loop {
                        tokio::select! {
                            biased;
                            _ = session_cancel.cancelled() => break,
                            chunk = chunks.next() => match chunk {
                                Some(Ok(bytes)) => {
                                    if output_tx.send(bytes.to_vec()).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Err(error)) => {
                                    debug!(target = %target, "shell output ended: {error}");
                                    break;
                                }
                                None => break,
                            },
                            Some(bytes) = input_rx.recv() => {
                                if let Err(error) = stdin.write_all(&bytes).await {
                                    debug!(target = %target, "shell input closed: {error}");
                                    break;
                                }
                            }
                            Some((width, height)) = resize_rx.recv() => {
                                if let Some(size_tx) = size_tx.as_mut() {
                                    let _ = size_tx.send(TerminalSize { width, height }).await;
                                }
                            }
                        }
                    }
                    attached.abort();
                });

                Ok(ExecChannel {
                    output,
                    input,
                    resize,
                })
            },
            cancel,
        )
    }
}

async fn forward<S, T>(
    stream: S,
    mut tx: stream_channel::Sender<Result<T>>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<T>>,
{
    let mut stream = pin!(stream);
    while let Some(item) = next_or_cancelled(&cancel, &mut stream).await {
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            break;
        }
    }
}

/// Maps one raw watch frame. An expired resource version is reported as a
/// failure carrying HTTP 410 so the caller can tell it from a broken stream.
fn translate_watch_event(event: Result<WatchEvent<Pod>>) -> Option<Result<PodEvent>> {
    let event = match event {
        Ok(event) => event,
        Err(error) => return Some(Err(error)),
    };

    let (kind, pod) = match event {
        WatchEvent::Added(pod) => (WatchKind::Added, pod),
        WatchEvent::Modified(pod) => (WatchKind::Modified, pod),
        WatchEvent::Deleted(pod) => (WatchKind::Deleted, pod),
        WatchEvent::Bookmark(_) => return None,
        WatchEvent::Error(status) => {
            if status.code != HTTP_GONE {
                warn!(code = status.code, "pod watch error: {}", status.message);
            }
            return Some(Err(anyhow!(HttpFailure {
                code: status.code,
                message: status.message.clone(),
            })));
        }
    };

    Some(Ok(PodEvent {
        kind,
        pod: pod_record(pod),
    }))
}

pub fn is_expected_disconnect(error: &anyhow::Error) -> bool {
    matches!(classify(error), FailureKind::Http(HTTP_GONE))
}

pub fn pod_record(pod: Pod) -> PodRecord {
    let metadata = pod.metadata;
    let spec = pod.spec.unwrap_or_default();
    let status = pod.status.unwrap_or_default();

    PodRecord {
        namespace: metadata.namespace.unwrap_or_default(),
        name: metadata.name.unwrap_or_default(),
        uid: metadata.uid.unwrap_or_default(),
        phase: status.phase.unwrap_or_else(|| "Unknown".to_string()),
        deleting: metadata.deletion_timestamp.is_some(),
        start_time: status.start_time.as_ref().and_then(time_to_utc),
        created_at: metadata.creation_timestamp.as_ref().and_then(time_to_utc),
        node_name: spec.node_name,
        resource_version: metadata.resource_version,
        containers: spec.containers.iter().map(container_info).collect(),
    }
}

fn container_info(container: &Container) -> ContainerInfo {
    let limits = container
        .resources
        .as_ref()
        .and_then(|resources| resources.limits.as_ref());

    ContainerInfo {
        name: container.name.clone(),
        limits: ResourceLimits {
            memory_bytes: limits
                .and_then(|limits| limits.get("memory"))
                .and_then(|quantity| parse_memory_bytes(&quantity.0)),
            cpu_millicores: limits
                .and_then(|limits| limits.get("cpu"))
                .and_then(|quantity| parse_cpu_millicores(&quantity.0)),
        },
    }
}

fn time_to_utc(time: &Time) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(time.0.as_second(), 0)
}

#[derive(Debug, Default, Deserialize)]
struct RawContainerInfo {
    #[serde(default)]
    spec: RawSpec,
    #[serde(default)]
    stats: Vec<RawStats>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSpec {
    #[serde(default)]
    has_network: bool,
    memory: Option<RawMemorySpec>,
    cpu: Option<RawCpuSpec>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMemorySpec {
    limit: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCpuSpec {
    quota: Option<i64>,
    period: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStats {
    timestamp: String,
    #[serde(default)]
    cpu: RawCpuStats,
    #[serde(default)]
    memory: RawMemoryStats,
    network: Option<RawNetworkStats>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCpuStats {
    #[serde(default)]
    usage: RawCpuUsage,
}

#[derive(Debug, Default, Deserialize)]
struct RawCpuUsage {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    user: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RawMemoryStats {
    #[serde(default)]
    usage: u64,
    #[serde(default)]
    cache: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RawNetworkStats {
    #[serde(default)]
    rx_bytes: u64,
    #[serde(default)]
    tx_bytes: u64,
}

fn container_stats_from_raw(raw: RawContainerInfo) -> ContainerStats {
    let samples = raw
        .stats
        .into_iter()
        .filter_map(|stats| {
            let timestamp = DateTime::parse_from_rfc3339(&stats.timestamp)
                .ok()?
                .with_timezone(&Utc);
            Some(MetricSample {
                timestamp,
                memory_usage: stats.memory.usage,
                memory_cache: stats.memory.cache,
                cpu_user: stats.cpu.usage.user,
                cpu_total: stats.cpu.usage.total,
                network: stats.network.map(|network| NetworkSample {
                    rx_bytes: network.rx_bytes,
                    tx_bytes: network.tx_bytes,
                }),
            })
        })
        .collect();

    // cAdvisor reports "no limit" as a huge sentinel rather than omitting it.
    let memory_limit = raw
        .spec
        .memory
        .and_then(|memory| memory.limit)
        .filter(|limit| *limit < u64::MAX / 2);
    let (cpu_quota, cpu_period) = raw
        .spec
        .cpu
        .map(|cpu| (cpu.quota.filter(|quota| *quota > 0), cpu.period))
        .unwrap_or_default();

    ContainerStats {
        samples,
        spec: StatsSpec {
            memory_limit,
            cpu_quota,
            cpu_period,
            has_network: raw.spec.has_network,
        },
    }
}

fn parse_cpu_millicores(value: &str) -> Option<u64> {
    const UNITS: [(char, f64); 3] = [('m', 1.0), ('u', 0.001), ('n', 0.000_001)];

    let raw = value.trim();
    if raw.is_empty() {
        return None;
    }
    let (number, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, multiplier)| {
            raw.strip_suffix(*suffix)
                .map(|number| (number, *multiplier))
        })
        .unwrap_or((raw, 1_000.0));

    non_negative(number.parse::<f64>().ok()? * multiplier)
}

fn non_negative(value: f64) -> Option<u64> {
    let rounded = value.round();
    (rounded.is_finite() && rounded >= 0.0).then_some(rounded as u64)
}

fn parse_memory_bytes(value: &str) -> Option<u64> {
    const UNITS: [(&str, f64); 12] = [
        ("Ei", 1_152_921_504_606_846_976.0),
        ("Pi", 1_125_899_906_842_624.0),
        ("Ti", 1_099_511_627_776.0),
        ("Gi", 1_073_741_824.0),
        ("Mi", 1_048_576.0),
        ("Ki", 1_024.0),
        ("E", 1_000_000_000_000_000_000.0),
        ("P", 1_000_000_000_000_000.0),
        ("T", 1_000_000_000_000.0),
        ("G", 1_000_000_000.0),
        ("M", 1_000_000.0),
        ("k", 1_000.0),
    ];

    let raw = value.trim();
    if raw.is_empty() {
        return None;
    }

    let (number, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, multiplier)| {
            raw.strip_suffix(suffix)
                .map(|number| (number, *multiplier))
        })
        .unwrap_or((raw, 1.0));

    non_negative(number.parse::<f64>().ok()? * multiplier)
}
