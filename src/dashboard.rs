use anyhow::Error;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancellations::{self, Cancellations, exec_key, exec_watch_key};
use crate::config::DashboardSettings;
use crate::exec::{ExecSessions, OpenOutcome, SessionKey, SessionStatus};
use crate::k8s::{
    ByteStream, ClusterClient, ExecChannel, FailureKind, PodEventStream, classify,
    compact_error, is_expected_disconnect,
};
use crate::logs::LogView;
use crate::model::{
    ContainerStats, PanelState, PodEvent, PodList, PodRecord, Selection, StatsTarget, WatchKind,
};
use crate::pods::{
    Backoff, MirrorChange, PodMirror, SelectionChange, SyncState, next_container, streams_allowed,
};
use crate::stats::{Graphs, PollFailure, poll_failure};
use crate::task::{Pending, Progress, Task, next_or_cancelled};

/// Completions and stream items produced by background tasks. Each one
/// carries the namespace generation, selection epoch or session id it was
/// started for; the dashboard drops those that no longer match.
pub enum DashboardEvent {
    Progress {
        label: &'static str,
        progress: Progress,
    },
    Cancelled {
        label: &'static str,
    },
    PodsListed {
        generation: u64,
        list: PodList,
    },
    PodsListFailed {
        generation: u64,
        error: Error,
    },
    PodsWatchOpened {
        generation: u64,
    },
    Pod {
        generation: u64,
        event: PodEvent,
    },
    PodsWatchEnded {
        generation: u64,
        error: Option<Error>,
    },
    RetryListing {
        generation: u64,
    },
    RefreshAges {
        generation: u64,
    },
    LogChunk {
        epoch: u64,
        chunk: Vec<u8>,
    },
    LogEnded {
        epoch: u64,
        error: Option<Error>,
    },
    LogFlush {
        epoch: u64,
    },
    LogPodChecked {
        epoch: u64,
        pod: Result<PodRecord, Error>,
    },
    StatsPolled {
        epoch: u64,
        stats: ContainerStats,
    },
    StatsFailed {
        epoch: u64,
        error: Error,
    },
    StatsDue {
        epoch: u64,
    },
    ExecReady {
        session: u64,
        input: mpsc::Sender<Vec<u8>>,
        resize: mpsc::Sender<(u16, u16)>,
    },
    ExecOutput {
        session: u64,
        bytes: Vec<u8>,
    },
    ExecClosed {
        session: u64,
        error: Option<Error>,
    },
    ExecPod {
        session: u64,
        event: PodEvent,
    },
    ExecWatchEnded {
        session: u64,
        error: Option<Error>,
    },
}

const LISTING: &str = "listing pods";
const LOADING_STATS: &str = "loading stats";
const OPENING_SHELL: &str = "opening shell";

/// Owns the pod mirror, the selection and every background task started
/// for them. All mutation happens in [`Dashboard::handle`] and the public
/// commands, called from one event loop.
pub struct Dashboard {
    client: Arc<dyn ClusterClient>,
    settings: DashboardSettings,
    events: mpsc::Sender<DashboardEvent>,
    namespace: String,
    generation: u64,
    mirror: PodMirror,
    sync_state: SyncState,
    backoff: Backoff,
    selection: Selection,
    panel: Option<PanelState>,
    streams_active: bool,
    logs: LogView,
    graphs: Graphs,
    sessions: ExecSessions,
    cancellations: Cancellations,
    activity: Option<(&'static str, &'static str)>,
    status: Option<String>,
    ages_at: DateTime<Utc>,
}

impl Dashboard {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        settings: DashboardSettings,
        events: mpsc::Sender<DashboardEvent>,
    ) -> Self {
        Self {
            client,
            backoff: Backoff::new(settings.retry_initial, settings.retry_max),
            logs: LogView::new(settings.log_buffer_lines),
            settings,
            events,
            namespace: String::new(),
            generation: 0,
            mirror: PodMirror::default(),
            sync_state: SyncState::Idle,
            selection: Selection::default(),
            panel: None,
            streams_active: false,
            graphs: Graphs::default(),
            sessions: ExecSessions::default(),
            cancellations: Cancellations::new(),
            activity: None,
            status: None,
            ages_at: Utc::now(),
        }
    }

    pub fn switch_namespace(&mut self, namespace: impl Into<String>) {
        self.cancellations.run(cancellations::DASHBOARD);
        self.mirror.clear();
        self.selection.clear();
        self.panel = None;
        self.streams_active = false;
        self.logs.reset();
        self.graphs = Graphs::default();
        self.activity = None;
        self.backoff.reset();
        self.generation += 1;
        self.namespace = namespace.into();
        info!(namespace = %self.namespace, generation = self.generation, "namespace selected");
        self.start_listing();
    }

    pub fn shutdown(&mut self) {
        let released = self.cancellations.run_all();
        debug!(released, "dashboard shut down");
    }

    pub fn handle(&mut self, event: DashboardEvent) {
        match event {
            DashboardEvent::Progress { label, progress } => {
                self.activity = Some((label, progress.frame));
            }
            DashboardEvent::Cancelled { label } => self.clear_activity(label),
            DashboardEvent::PodsListed { generation, list } => {
                self.on_pods_listed(generation, list)
            }
            DashboardEvent::PodsListFailed { generation, error } => {
                if generation == self.generation {
                    self.clear_activity(LISTING);
                    self.retry_after_failure(error);
                }
            }
            DashboardEvent::PodsWatchOpened { generation } => {
                if generation == self.generation {
                    self.sync_state = SyncState::Watching;
                }
            }
            DashboardEvent::Pod { generation, event } => self.on_pod_event(generation, event),
            DashboardEvent::PodsWatchEnded { generation, error } => {
                self.on_pods_watch_ended(generation, error)
            }
            DashboardEvent::RetryListing { generation } => {
                if generation == self.generation {
                    self.start_listing();
                }
            }
            DashboardEvent::RefreshAges { generation } => {
                if generation == self.generation {
                    self.ages_at = Utc::now();
                }
            }
            DashboardEvent::LogChunk { epoch, chunk } => self.on_log_chunk(epoch, &chunk),
            DashboardEvent::LogEnded { epoch, error } => self.on_log_ended(epoch, error),
            DashboardEvent::LogFlush { epoch } => self.on_log_flush(epoch),
            DashboardEvent::LogPodChecked { epoch, pod } => self.on_log_pod_checked(epoch, pod),
            DashboardEvent::StatsPolled { epoch, stats } => self.on_stats_polled(epoch, stats),
            DashboardEvent::StatsFailed { epoch, error } => self.on_stats_failed(epoch, error),
            DashboardEvent::StatsDue { epoch } => {
                if self.is_current(epoch) {
                    self.poll_stats(epoch);
                }
            }
            DashboardEvent::ExecReady {
                session,
                input,
                resize,
            } => {
                self.clear_activity(OPENING_SHELL);
                if !self.sessions.attach(session, input, resize) {
                    debug!(session, "shell attached after its tab closed");
                }
            }
            DashboardEvent::ExecOutput { session, bytes } => self.sessions.feed(session, &bytes),
            DashboardEvent::ExecClosed { session, error } => self.on_exec_closed(session, error),
            DashboardEvent::ExecPod { session, event } => self.on_exec_pod(session, event),
            DashboardEvent::ExecWatchEnded { session, error } => {
                self.on_exec_watch_ended(session, error)
            }
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        epoch == self.selection.epoch && self.selection.pod.is_some()
    }

    fn clear_activity(&mut self, label: &'static str) {
        if self.activity.is_some_and(|(current, _)| current == label) {
            self.activity = None;
        }
    }

    fn progress_hook(&self, label: &'static str) -> impl FnMut(Progress) + Send + 'static {
        let tx = self.events.clone();
        move |progress| {
            let _ = tx.try_send(DashboardEvent::Progress { label, progress });
        }
    }

    fn cancel_hook(&self, label: &'static str) -> impl FnOnce(CancellationToken) + Send + 'static {
        let tx = self.events.clone();
        move |_| {
            let _ = tx.try_send(DashboardEvent::Cancelled { label });
        }
    }

    fn start_listing(&mut self) {
        self.sync_state = SyncState::Listing;
        let generation = self.generation;
        debug!(namespace = %self.namespace, generation, "listing pods");

        let handle = Task::new(self.client.get_pods(&self.namespace))
            .on_progress(self.progress_hook(LISTING))
            .on_cancel(self.cancel_hook(LISTING))
            .spawn(
                reply(&self.events, move |list: PodList| DashboardEvent::PodsListed {
                    generation,
                    list,
                }),
                reply(&self.events, move |error: Error| DashboardEvent::PodsListFailed {
                    generation,
                    error,
                }),
            );
        self.cancellations
            .replace(cancellations::PODS_WATCH, handle.into_cleanup());
    }

    fn on_pods_listed(&mut self, generation: u64, list: PodList) {
        if generation != self.generation {
            return;
        }
        self.clear_activity(LISTING);
        info!(
            namespace = %self.namespace,
            pods = list.items.len(),
            resource_version = %list.resource_version,
            "pods listed"
        );
        self.mirror.replace_all(list);
        self.backoff.reset();
        self.status = None;
        self.reconcile_selection();
        self.start_age_refresh();
        self.start_watch();
    }

    fn reconcile_selection(&mut self) {
        let Some(uid) = self.selection.pod.clone() else {
            return;
        };
        match self.mirror.get(&uid).cloned() {
            None => self.selected_pod_deleted(),
            Some(pod) => self.selected_pod_changed(&pod),
        }
    }

    fn start_age_refresh(&mut self) {
        let generation = self.generation;
        let period = self.settings.age_refresh;
        let tx = self.events.clone();
        let ticker = Pending::new(async move {
            let mut ticks = interval_at(tokio::time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                if tx
                    .send(DashboardEvent::RefreshAges { generation })
                    .await
                    .is_err()
                {
                    return Ok::<(), Error>(());
                }
            }
        });
        let handle = Task::new(ticker).spawn(|_| async {}, |_| async {});
        self.cancellations
            .replace(cancellations::REFRESH_POD_AGES, handle.into_cleanup());
    }

    fn start_watch(&mut self) {
        let generation = self.generation;
        let pending = self
            .client
            .watch_pods(&self.namespace, self.mirror.resource_version());
        let cancel = pending.cancel_handle();
        let tx = self.events.clone();

        let handle = Task::new(pending).spawn(
            move |stream: PodEventStream| async move {
                if tx
                    .send(DashboardEvent::PodsWatchOpened { generation })
                    .await
                    .is_err()
                {
                    return;
                }
                let error = drain_events(stream, &cancel, &tx, |event| DashboardEvent::Pod {
                    generation,
                    event,
                })
                .await;
                if let Ok(error) = error
                    && !cancel.is_cancelled()
                {
                    let _ = tx
                        .send(DashboardEvent::PodsWatchEnded { generation, error })
                        .await;
                }
            },
            reply(&self.events, move |error: Error| DashboardEvent::PodsWatchEnded {
                generation,
                error: Some(error),
            }),
        );
        self.cancellations
            .replace(cancellations::PODS_WATCH, handle.into_cleanup());
    }

    fn on_pod_event(&mut self, generation: u64, event: PodEvent) {
        if generation != self.generation {
            return;
        }
        match self.mirror.apply(event) {
            MirrorChange::Removed(uid) if self.selection.is_pod(&uid) => {
                info!(pod = %uid, "selected pod deleted");
                self.selected_pod_deleted();
            }
            MirrorChange::Replaced {
                uid,
                became_terminating,
            } if self.selection.is_pod(&uid) => {
                if let Some(pod) = self.mirror.get(&uid).cloned() {
                    if became_terminating {
                        info!(pod = %pod.name, "selected pod terminating");
                    }
                    self.selected_pod_changed(&pod);
                }
            }
            MirrorChange::Added(uid) if self.selection.is_pod(&uid) => {
                if let Some(pod) = self.mirror.get(&uid).cloned() {
                    self.selected_pod_changed(&pod);
                }
            }
            _ => {}
        }
    }

    fn selected_pod_deleted(&mut self) {
        self.cancellations.run(cancellations::POD);
        self.selection.clear();
        self.streams_active = false;
        self.panel = Some(PanelState::Deleted);
        self.graphs = Graphs::notice(PanelState::Deleted.to_string());
    }

    /// Updates panels for a new version of the selected pod. Log and stats
    /// tasks keep running while the pod terminates.
    fn selected_pod_changed(&mut self, pod: &PodRecord) {
        self.panel = Some(pod.panel_state());

        if !self.streams_active && pod.is_running() {
            let epoch = self.selection.epoch;
            self.start_pod_tasks(epoch);
        }
    }

    fn on_pods_watch_ended(&mut self, generation: u64, error: Option<Error>) {
        if generation != self.generation {
            return;
        }
        self.cancellations.run(cancellations::REFRESH_POD_AGES);

        match error {
            Some(error) if !is_expected_disconnect(&error) => self.retry_after_failure(error),
            _ => {
                debug!(namespace = %self.namespace, "pod watch closed, relisting");
                self.start_listing();
            }
        }
    }

    fn retry_after_failure(&mut self, error: Error) {
        let delay = self.backoff.next_delay();
        warn!(
            namespace = %self.namespace,
            retry_in_ms = delay.as_millis() as u64,
            "pod sync failed: {error:#}"
        );
        self.sync_state = SyncState::Error;
        self.status = Some(format!("pod sync failed: {}", compact_error(&error)));

        let generation = self.generation;
        let handle = Task::new(Pending::delay(delay)).spawn(
            reply(&self.events, move |_: ()| DashboardEvent::RetryListing { generation }),
            |_| async {},
        );
        self.cancellations
            .replace(cancellations::PODS_WATCH, handle.into_cleanup());
    }

    /// Selects `uid` for the log and graph panels. Selecting the pod again
    /// moves to its next container.
    pub fn select_pod(&mut self, uid: &str) {
        let Some(pod) = self.mirror.get(uid).cloned() else {
            return;
        };
        let container = match next_container(&self.selection, &pod) {
            SelectionChange::Unchanged => return,
            SelectionChange::NoContainers => {
                self.status = Some(format!("{} has no containers", pod.name));
                return;
            }
            SelectionChange::Container(container) => container,
        };

        self.cancellations.run(cancellations::POD);
        self.streams_active = false;
        let epoch = self.selection.select(pod.uid.clone(), container.clone());
        info!(pod = %pod.name, container = %container, epoch, "pod selected");
        self.logs.reset();
        self.panel = Some(pod.panel_state());

        if streams_allowed(&pod) {
            self.start_pod_tasks(epoch);
        } else {
            self.graphs = Graphs::notice(pod.phase.clone());
        }
    }

    fn start_pod_tasks(&mut self, epoch: u64) {
        self.streams_active = true;
        self.graphs = Graphs::loading();
        self.start_log_follow(epoch, None);
        self.poll_stats(epoch);
    }

    fn selected(&self) -> Option<(PodRecord, String)> {
        let pod = self.mirror.get(self.selection.pod.as_deref()?)?.clone();
        let container = self.selection.container.clone()?;
        Some((pod, container))
    }

    fn start_log_follow(&mut self, epoch: u64, since: Option<String>) {
        let Some((pod, container)) = self.selected() else {
            return;
        };
        debug!(pod = %pod.name, container = %container, since = ?since, "following logs");
        let pending = self
            .client
            .follow_log(&pod.namespace, &pod.name, &container, since.as_deref());
        let cancel = pending.cancel_handle();
        let tx = self.events.clone();

        let handle = Task::new(pending).spawn(
            move |stream: ByteStream| async move {
                let error = drain_events(stream, &cancel, &tx, |chunk| DashboardEvent::LogChunk {
                    epoch,
                    chunk,
                })
                .await;
                if let Ok(error) = error
                    && !cancel.is_cancelled()
                {
                    let _ = tx.send(DashboardEvent::LogEnded { epoch, error }).await;
                }
            },
            reply(&self.events, move |error: Error| DashboardEvent::LogEnded {
                epoch,
                error: Some(error),
            }),
        );
        self.cancellations
            .replace(cancellations::POD_LOGS, handle.into_cleanup());
    }

    fn on_log_chunk(&mut self, epoch: u64, chunk: &[u8]) {
        if !self.is_current(epoch) {
            return;
        }
        let accepted = self.logs.accept_chunk(chunk);
        if accepted > 0 && !self.cancellations.contains(cancellations::POD_LOGS_FLUSH) {
            let handle = Task::new(Pending::delay(self.settings.log_flush)).spawn(
                reply(&self.events, move |_: ()| DashboardEvent::LogFlush { epoch }),
                |_| async {},
            );
            self.cancellations
                .add(cancellations::POD_LOGS_FLUSH, handle.into_cleanup());
        }
    }

    fn on_log_flush(&mut self, epoch: u64) {
        if !self.is_current(epoch) {
            return;
        }
        self.cancellations.run(cancellations::POD_LOGS_FLUSH);
        if self.logs.has_pending() {
            self.logs.flush();
        }
    }

    fn on_log_ended(&mut self, epoch: u64, error: Option<Error>) {
        if !self.is_current(epoch) {
            return;
        }
        if let Some(error) = &error {
            debug!(epoch, "log stream ended: {error:#}");
        }
        self.logs.finish_stream();
        self.logs.flush();
        self.cancellations.run(cancellations::POD_LOGS);

        let Some((pod, _)) = self.selected() else {
            return;
        };
        let client = self.client.clone();
        let handle = Task::new(Pending::delay(self.settings.log_reconnect))
            .then(move |_| client.get_pod(&pod.namespace, &pod.name))
            .spawn(
                reply(&self.events, move |pod: PodRecord| {
                    DashboardEvent::LogPodChecked { epoch, pod: Ok(pod) }
                }),
                reply(&self.events, move |error: Error| {
                    DashboardEvent::LogPodChecked {
                        epoch,
                        pod: Err(error),
                    }
                }),
            );
        self.cancellations
            .replace(cancellations::POD_LOGS, handle.into_cleanup());
    }

    fn on_log_pod_checked(&mut self, epoch: u64, pod: Result<PodRecord, Error>) {
        if !self.is_current(epoch) {
            debug!(epoch, "selection changed, log follow stopped");
            return;
        }
        match pod {
            Ok(pod) if pod.is_running() && self.selection.is_pod(&pod.uid) => {
                let since = self.logs.resume_point();
                self.start_log_follow(epoch, since);
            }
            Ok(pod) => {
                info!(pod = %pod.name, phase = %pod.phase, "pod not running, log follow stopped");
                self.cancellations.run(cancellations::POD_LOGS);
            }
            Err(error) => {
                if classify(&error) != FailureKind::NotFound {
                    warn!("log reconnect check failed: {error:#}");
                }
                self.cancellations.run(cancellations::POD_LOGS);
            }
        }
    }

    fn poll_stats(&mut self, epoch: u64) {
        let Some((pod, container)) = self.selected() else {
            return;
        };
        let Some(node) = pod.node_name.clone() else {
            self.graphs = Graphs::notice("pod not scheduled");
            return;
        };
        let target = StatsTarget {
            node,
            namespace: pod.namespace.clone(),
            pod: pod.name.clone(),
            uid: pod.uid.clone(),
            container,
        };

        let mut task = Task::new(self.client.container_stats(&target));
        if self.graphs == Graphs::loading() {
            task = task
                .on_progress(self.progress_hook(LOADING_STATS))
                .on_cancel(self.cancel_hook(LOADING_STATS));
        }
        let handle = task.spawn(
            reply(&self.events, move |stats: ContainerStats| {
                DashboardEvent::StatsPolled { epoch, stats }
            }),
            reply(&self.events, move |error: Error| DashboardEvent::StatsFailed { epoch, error }),
        );
        self.cancellations
            .replace(cancellations::POD_STATS, handle.into_cleanup());
    }

    fn on_stats_polled(&mut self, epoch: u64, stats: ContainerStats) {
        if !self.is_current(epoch) {
            return;
        }
        self.clear_activity(LOADING_STATS);
        let limits = self
            .selected()
            .and_then(|(pod, container)| pod.container(&container).map(|info| info.limits))
            .unwrap_or_default();
        self.graphs = Graphs::from_stats(&stats, limits);

        let handle = Task::new(Pending::delay(self.settings.stats_interval)).spawn(
            reply(&self.events, move |_: ()| DashboardEvent::StatsDue { epoch }),
            |_| async {},
        );
        self.cancellations
            .replace(cancellations::POD_STATS, handle.into_cleanup());
    }

    fn on_stats_failed(&mut self, epoch: u64, error: Error) {
        if !self.is_current(epoch) {
            return;
        }
        self.clear_activity(LOADING_STATS);
        match poll_failure(classify(&error)) {
            PollFailure::Show(notice) => {
                debug!(notice, "stats poll failed: {error:#}");
                self.graphs = Graphs::notice(notice);
            }
            PollFailure::StopSilently => {}
            PollFailure::LogOnly => warn!("stats poll failed: {error:#}"),
        }
        self.cancellations.run(cancellations::POD_STATS);
    }

    /// Opens a shell in `uid`, or focuses the tab already open for the same
    /// container. Returns the session id.
    pub fn open_shell(&mut self, uid: &str) -> Option<u64> {
        let pod = self.mirror.get(uid)?.clone();
        let container = self
            .selection
            .is_pod(uid)
            .then(|| self.selection.container.clone())
            .flatten()
            .or_else(|| pod.containers.first().map(|container| container.name.clone()))?;

        let key = SessionKey {
            namespace: pod.namespace.clone(),
            pod: pod.name.clone(),
            container: container.clone(),
        };
        let session = match self.sessions.open(key) {
            OpenOutcome::Focused(session) => return Some(session),
            OpenOutcome::Created(session) => session,
        };
        info!(session, pod = %pod.name, container = %container, "opening shell");

        let pending = self
            .client
            .exec(&pod.namespace, &pod.name, &container, &self.settings.shell);
        let cancel = pending.cancel_handle();
        let tx = self.events.clone();
        let handle = Task::new(pending)
            .on_progress(self.progress_hook(OPENING_SHELL))
            .on_cancel(self.cancel_hook(OPENING_SHELL))
            .spawn(
                move |channel: ExecChannel| async move {
                    let ExecChannel {
                        mut output,
                        input,
                        resize,
                    } = channel;
                    let ready = DashboardEvent::ExecReady {
                        session,
                        input,
                        resize,
                    };
                    if tx.send(ready).await.is_err() {
                        return;
                    }
                    loop {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            bytes = output.recv() => match bytes {
                                Some(bytes) => {
                                    let output = DashboardEvent::ExecOutput { session, bytes };
                                    if tx.send(output).await.is_err() {
                                        return;
                                    }
                                }
                                None => break,
                            },
                        }
                    }
                    let _ = tx
                        .send(DashboardEvent::ExecClosed {
                            session,
                            error: None,
                        })
                        .await;
                },
                reply(&self.events, move |error: Error| DashboardEvent::ExecClosed {
                    session,
                    error: Some(error),
                }),
            );
        self.cancellations.add(exec_key(session), handle.into_cleanup());

        let resource_version = pod.resource_version.clone().unwrap_or_default();
        self.sessions.note_version(session, Some(resource_version));
        self.watch_session_pod(session, Duration::ZERO);
        Some(session)
    }

    fn watch_session_pod(&mut self, session: u64, delay: Duration) {
        let Some(key) = self.sessions.get(session).map(|session| session.key.clone()) else {
            return;
        };
        let resource_version = self
            .sessions
            .get(session)
            .map(|session| session.resource_version.clone())
            .unwrap_or_default();

        let client = self.client.clone();
        let pending = Pending::delay(delay)
            .then(move |_| client.watch_pod(&key.namespace, &key.pod, &resource_version));
        let cancel = pending.cancel_handle();
        let tx = self.events.clone();
        let handle = Task::new(pending).spawn(
            move |stream: PodEventStream| async move {
                let error = drain_events(stream, &cancel, &tx, |event| DashboardEvent::ExecPod {
                    session,
                    event,
                })
                .await;
                if let Ok(error) = error
                    && !cancel.is_cancelled()
                {
                    let _ = tx
                        .send(DashboardEvent::ExecWatchEnded { session, error })
                        .await;
                }
            },
            reply(&self.events, move |error: Error| DashboardEvent::ExecWatchEnded {
                session,
                error: Some(error),
            }),
        );
        self.cancellations
            .replace(exec_watch_key(session), handle.into_cleanup());
    }

    fn on_exec_pod(&mut self, session: u64, event: PodEvent) {
        if self.sessions.get(session).is_none() {
            return;
        }
        self.sessions
            .note_version(session, event.pod.resource_version.clone());
        match event.kind {
            WatchKind::Deleted => {
                self.sessions.set_status(session, SessionStatus::Deleted);
                self.cancellations.run(&exec_watch_key(session));
            }
            WatchKind::Modified if event.pod.deleting => {
                self.sessions.set_status(session, SessionStatus::Terminating)
            }
            _ => {}
        }
    }

    fn on_exec_watch_ended(&mut self, session: u64, error: Option<Error>) {
        let Some(status) = self.sessions.get(session).map(|session| session.status) else {
            return;
        };
        if status == SessionStatus::Deleted {
            self.cancellations.run(&exec_watch_key(session));
            return;
        }
        if let Some(error) = &error {
            if is_expected_disconnect(error) {
                self.sessions.note_version(session, Some(String::new()));
            } else {
                debug!(session, "pod watch for shell ended: {error:#}");
            }
        }
        self.watch_session_pod(session, self.settings.log_reconnect);
    }

    fn on_exec_closed(&mut self, session: u64, error: Option<Error>) {
        if let Some(error) = &error {
            warn!(session, "shell failed: {error:#}");
            self.status = Some(format!("shell failed: {}", compact_error(error)));
        }
        self.clear_activity(OPENING_SHELL);
        self.close_shell(session);
    }

    pub fn close_shell(&mut self, session: u64) {
        self.cancellations.run(&exec_key(session));
        if let Some(closed) = self.sessions.close(session) {
            info!(session, target = %closed.key, "shell closed");
        }
    }

    pub fn send_to_shell(&mut self, session: u64, bytes: Vec<u8>) {
        if !self.sessions.send_input(session, bytes) {
            debug!(session, "shell input dropped");
        }
    }

    pub fn resize_shells(&mut self, cols: u16, rows: u16) {
        self.sessions.resize(cols, rows);
    }

    pub fn focus_shell(&mut self, session: Option<u64>) {
        self.sessions.focus(session);
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    pub fn pods(&self) -> &[PodRecord] {
        self.mirror.pods()
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn selected_pod(&self) -> Option<&PodRecord> {
        self.mirror.get(self.selection.pod.as_deref()?)
    }

    pub fn panel_state(&self) -> Option<&PanelState> {
        self.panel.as_ref()
    }

    pub fn graphs(&self) -> &Graphs {
        &self.graphs
    }

    pub fn logs(&self) -> &LogView {
        &self.logs
    }

    pub fn sessions(&self) -> &ExecSessions {
        &self.sessions
    }

    pub fn activity(&self) -> Option<(&'static str, &'static str)> {
        self.activity
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn take_status(&mut self) -> Option<String> {
        self.status.take()
    }

    pub fn ages_at(&self) -> DateTime<Utc> {
        self.ages_at
    }
}

fn reply<T, F>(
    events: &mpsc::Sender<DashboardEvent>,
    make: F,
) -> impl FnOnce(T) -> BoxFuture<'static, ()> + Send + 'static
where
    T: Send + 'static,
    F: FnOnce(T) -> DashboardEvent + Send + 'static,
{
    let events = events.clone();
    move |value| {
        async move {
            let _ = events.send(make(value)).await;
        }
        .boxed()
    }
}

/// Forwards stream items as events until the stream ends, fails, or is
/// cancelled. `Err(())` means the event queue is gone; `Ok(error)` carries
/// the failure that ended the stream, if any.
async fn drain_events<T>(
    mut stream: futures::stream::BoxStream<'static, anyhow::Result<T>>,
    cancel: &CancellationToken,
    events: &mpsc::Sender<DashboardEvent>,
    wrap: impl Fn(T) -> DashboardEvent,
) -> Result<Option<Error>, ()> {
    while let Some(item) = next_or_cancelled(cancel, &mut stream).await {
        match item {
            Ok(value) => events.send(wrap(value)).await.map_err(|_| ())?,
            Err(error) => return Ok(Some(error)),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::{Dashboard, DashboardEvent};
    use crate::cancellations;
    use crate::config::DashboardSettings;
    use crate::exec::SessionStatus;
    use crate::k8s::{ByteStream, ClusterClient, ExecChannel, HttpFailure, PodEventStream};
    use crate::model::fixtures::pod;
    use crate::model::{
        ContainerStats, MetricSample, PanelState, PodEvent, PodList, PodRecord, StatsSpec,
        StatsTarget, WatchKind,
    };
    use crate::pods::SyncState;
    use crate::stats::{Graph, Graphs};
    use crate::task::Pending;
    use anyhow::anyhow;
    use chrono::Utc;
    use futures::StreamExt;
    use futures::channel::mpsc as stream_channel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    type StreamSender<T> = stream_channel::Sender<anyhow::Result<T>>;

    #[derive(Default)]
    struct FakeState {
        pods: Vec<PodRecord>,
        stats_failure: Option<u16>,
        calls: Vec<String>,
        watch: Option<StreamSender<PodEvent>>,
        logs: Vec<(StreamSender<Vec<u8>>, CancellationToken)>,
        log_since: Vec<Option<String>>,
        pod_watches: Vec<(StreamSender<PodEvent>, CancellationToken)>,
        shells: Vec<(mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>, CancellationToken)>,
    }

    #[derive(Default)]
    struct FakeCluster {
        state: Mutex<FakeState>,
    }

    impl FakeCluster {
        fn with_pods(pods: Vec<PodRecord>) -> Arc<Self> {
            let cluster = Self::default();
            cluster.state.lock().unwrap().pods = pods;
            Arc::new(cluster)
        }

        fn calls(&self, name: &str) -> usize {
            let state = self.state.lock().unwrap();
            state.calls.iter().filter(|call| *call == name).count()
        }

        fn record(&self, name: &str) -> std::sync::MutexGuard<'_, FakeState> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(name.to_string());
            state
        }
    }

    type FakeStream<T> = futures::stream::BoxStream<'static, anyhow::Result<T>>;

    fn stream_pending<T: Send + 'static>() -> (StreamSender<T>, Pending<FakeStream<T>>) {
        let (tx, rx) = stream_channel::channel(16);
        (tx, Pending::ready(rx.boxed()))
    }

    impl ClusterClient for FakeCluster {
        fn get_pods(&self, _namespace: &str) -> Pending<PodList> {
            let state = self.record("get_pods");
            Pending::ready(PodList {
                resource_version: "100".to_string(),
                items: state.pods.clone(),
            })
        }

        fn watch_pods(
            &self,
            _namespace: &str,
            _resource_version: &str,
        ) -> Pending<PodEventStream> {
            let mut state = self.record("watch_pods");
            let (tx, pending) = stream_pending();
            state.watch = Some(tx);
            pending
        }

        fn watch_pod(
            &self,
            _namespace: &str,
            _name: &str,
            _resource_version: &str,
        ) -> Pending<PodEventStream> {
            let mut state = self.record("watch_pod");
            let (tx, pending) = stream_pending();
            state.pod_watches.push((tx, pending.cancel_handle()));
            pending
        }

        fn get_pod(&self, _namespace: &str, name: &str) -> Pending<PodRecord> {
            let state = self.record("get_pod");
            match state.pods.iter().find(|pod| pod.name == name) {
                Some(pod) => Pending::ready(pod.clone()),
                None => Pending::failed(anyhow!(HttpFailure {
                    code: 404,
                    message: "not found".to_string(),
                })),
            }
        }

        fn follow_log(
            &self,
            _namespace: &str,
            _name: &str,
            _container: &str,
            since_time: Option<&str>,
        ) -> Pending<ByteStream> {
            let mut state = self.record("follow_log");
            state.log_since.push(since_time.map(str::to_string));
            let (tx, pending) = stream_pending();
            state.logs.push((tx, pending.cancel_handle()));
            pending
        }

        fn container_stats(&self, _target: &StatsTarget) -> Pending<ContainerStats> {
            let state = self.record("container_stats");
            if let Some(code) = state.stats_failure {
                return Pending::failed(anyhow!(HttpFailure {
                    code,
                    message: "forbidden".to_string(),
                }));
            }
            let now = Utc::now();
            Pending::ready(ContainerStats {
                samples: vec![MetricSample {
                    timestamp: now,
                    memory_usage: 1_024,
                    memory_cache: 0,
                    cpu_user: 0,
                    cpu_total: 0,
                    network: None,
                }],
                spec: StatsSpec::default(),
            })
        }

        fn exec(
            &self,
            _namespace: &str,
            _name: &str,
            _container: &str,
            _command: &[String],
        ) -> Pending<ExecChannel> {
            let mut state = self.record("exec");
            let (output_tx, output) = mpsc::channel(16);
            let (input, input_rx) = mpsc::channel(16);
            let (resize, _resize_rx) = mpsc::channel(16);
            let pending = Pending::ready(ExecChannel {
                output,
                input,
                resize,
            });
            state.shells.push((output_tx, input_rx, pending.cancel_handle()));
            pending
        }
    }

    struct Harness {
        cluster: Arc<FakeCluster>,
        dashboard: Dashboard,
        events: mpsc::Receiver<DashboardEvent>,
    }

    impl Harness {
        fn new(pods: Vec<PodRecord>) -> Self {
            let cluster = FakeCluster::with_pods(pods);
            let (tx, events) = mpsc::channel(256);
            let dashboard = Dashboard::new(cluster.clone(), DashboardSettings::default(), tx);
            Self {
                cluster,
                dashboard,
                events,
            }
        }

        async fn settle(&mut self) {
            let quiet = Duration::from_millis(50);
            while let Ok(Some(event)) = timeout(quiet, self.events.recv()).await {
                self.dashboard.handle(event);
            }
        }

        async fn started(pods: Vec<PodRecord>) -> Self {
            let mut harness = Self::new(pods);
            harness.dashboard.switch_namespace("default");
            harness.settle().await;
            harness
        }

        fn push_watch_event(&self, kind: WatchKind, pod: PodRecord) {
            let mut state = self.cluster.state.lock().unwrap();
            let watch = state.watch.as_mut().expect("watch opened");
            watch.try_send(Ok(PodEvent { kind, pod })).expect("watch buffer");
        }

        fn log_token(&self, index: usize) -> CancellationToken {
            self.cluster.state.lock().unwrap().logs[index].1.clone()
        }

        fn send_log(&self, index: usize, chunk: &[u8]) {
            let mut state = self.cluster.state.lock().unwrap();
            state.logs[index].0.try_send(Ok(chunk.to_vec())).unwrap();
        }

        fn close_log(&self, index: usize) {
            self.cluster.state.lock().unwrap().logs[index].0.close_channel();
        }

        async fn count_flushes(&mut self, quiet: Duration) -> usize {
            let mut flushes = 0;
            while let Ok(Some(event)) = timeout(quiet, self.events.recv()).await {
                if matches!(event, DashboardEvent::LogFlush { .. }) {
                    flushes += 1;
                }
                self.dashboard.handle(event);
            }
            flushes
        }

        fn rendered_logs(&self) -> Vec<String> {
            self.dashboard
                .logs()
                .lines()
                .map(|line| line.content.clone())
                .collect()
        }
    }

    fn running(uid: &str, containers: &[&str]) -> PodRecord {
        pod(uid, uid, "Running", containers)
    }

    #[tokio::test(start_paused = true)]
    async fn listing_fills_mirror_and_opens_watch() {
        let harness = Harness::started(vec![running("p1", &["c1"]), running("p2", &["c1"])]).await;

        assert_eq!(harness.dashboard.pods().len(), 2);
        assert_eq!(harness.dashboard.sync_state(), SyncState::Watching);
        assert_eq!(harness.cluster.calls("watch_pods"), 1);
        assert!(harness.dashboard.cancellations.contains(cancellations::REFRESH_POD_AGES));
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_the_selected_pod_tears_down_its_tasks() {
        let mut harness = Harness::started(vec![running("p1", &["c1"])]).await;
        harness.dashboard.select_pod("p1");
        harness.settle().await;

        assert_eq!(harness.cluster.calls("follow_log"), 1);
        assert_eq!(harness.cluster.calls("container_stats"), 1);
        assert!(harness.dashboard.cancellations.contains(cancellations::POD_LOGS));
        assert!(harness.dashboard.cancellations.contains(cancellations::POD_STATS));
        let log_token = harness.log_token(0);
        let teardowns = Arc::new(AtomicUsize::new(0));
        let counter = teardowns.clone();
        harness
            .dashboard
            .cancellations
            .add(format!("{}.counter", cancellations::POD), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        harness.push_watch_event(WatchKind::Deleted, running("p1", &["c1"]));
        harness.settle().await;
        harness.push_watch_event(WatchKind::Deleted, running("p1", &["c1"]));
        harness.settle().await;

        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert!(log_token.is_cancelled());
        assert!(!harness.dashboard.cancellations.contains(cancellations::POD));
        assert!(harness.dashboard.cancellations.contains(cancellations::PODS_WATCH));
        assert_eq!(harness.dashboard.selection().pod, None);
        assert_eq!(harness.dashboard.panel_state(), Some(&PanelState::Deleted));
        assert_eq!(harness.dashboard.graphs(), &Graphs::notice("DELETED"));
        assert!(harness.dashboard.pods().is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        harness.settle().await;
        assert_eq!(harness.cluster.calls("container_stats"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reselecting_a_single_container_pod_is_a_no_op() {
        let mut harness = Harness::started(vec![running("p1", &["c1"])]).await;
        harness.dashboard.select_pod("p1");
        harness.settle().await;
        let epoch = harness.dashboard.selection().epoch;

        harness.dashboard.select_pod("p1");
        harness.settle().await;

        assert_eq!(harness.dashboard.selection().epoch, epoch);
        assert_eq!(harness.cluster.calls("follow_log"), 1);
        assert!(!harness.log_token(0).is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_stats_show_unauthorized_and_stop_polling() {
        let mut harness = Harness::started(vec![running("p1", &["c1"])]).await;
        harness.cluster.state.lock().unwrap().stats_failure = Some(403);

        harness.dashboard.select_pod("p1");
        harness.settle().await;
        assert_eq!(harness.dashboard.graphs(), &Graphs::notice("unauthorized"));
        assert!(!harness.dashboard.cancellations.contains(cancellations::POD_STATS));

        tokio::time::sleep(Duration::from_secs(30)).await;
        harness.settle().await;
        assert_eq!(harness.cluster.calls("container_stats"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_repoll_on_interval() {
        let mut harness = Harness::started(vec![running("p1", &["c1"])]).await;
        harness.dashboard.select_pod("p1");
        harness.settle().await;
        assert!(matches!(harness.dashboard.graphs().memory, Graph::Series(_)));

        tokio::time::sleep(Duration::from_secs(11)).await;
        harness.settle().await;
        assert_eq!(harness.cluster.calls("container_stats"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn log_lines_flush_and_reconnect_from_last_second() {
        let mut harness = Harness::started(vec![running("p1", &["c1"])]).await;
        harness.dashboard.select_pod("p1");
        harness.settle().await;

        {
            let mut state = harness.cluster.state.lock().unwrap();
            let (log, _) = &mut state.logs[0];
            log.try_send(Ok(b"2024-05-01T10:00:00.250Z ready\n".to_vec()))
                .unwrap();
        }
        harness.settle().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        harness.settle().await;
        let rendered = harness
            .dashboard
            .logs()
            .lines()
            .map(|line| line.content.clone())
            .collect::<Vec<_>>();
        assert_eq!(rendered, vec!["ready"]);

        harness.cluster.state.lock().unwrap().logs[0].0.close_channel();
        harness.settle().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        harness.settle().await;

        assert_eq!(harness.cluster.calls("get_pod"), 1);
        let state = harness.cluster.state.lock().unwrap();
        assert_eq!(
            state.log_since,
            vec![None, Some("2024-05-01T10:00:00Z".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn log_chunks_in_one_window_flush_once() {
        let mut harness = Harness::started(vec![running("p1", &["c1"])]).await;
        harness.dashboard.select_pod("p1");
        harness.settle().await;

        harness.send_log(0, b"2024-05-01T10:00:00.100Z one\n");
        harness.send_log(0, b"2024-05-01T10:00:00.200Z two\n");
        harness.send_log(0, b"2024-05-01T10:00:00.300Z three\n");
        assert_eq!(harness.count_flushes(Duration::from_millis(300)).await, 1);
        assert_eq!(harness.rendered_logs(), vec!["one", "two", "three"]);

        harness.send_log(0, b"");
        assert_eq!(harness.count_flushes(Duration::from_millis(300)).await, 0);
        assert!(!harness.dashboard.cancellations.contains(cancellations::POD_LOGS_FLUSH));

        harness.send_log(0, b"2024-05-01T10:00:01.000Z four\n");
        assert_eq!(harness.count_flushes(Duration::from_millis(300)).await, 1);
        assert_eq!(harness.rendered_logs(), vec!["one", "two", "three", "four"]);
    }

    #[tokio::test(start_paused = true)]
    async fn log_follow_stops_when_pod_is_no_longer_running() {
        let mut harness = Harness::started(vec![running("p1", &["c1"])]).await;
        harness.dashboard.select_pod("p1");
        harness.settle().await;

        harness.cluster.state.lock().unwrap().pods[0].phase = "Succeeded".to_string();
        harness.close_log(0);
        harness.settle().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        harness.settle().await;

        assert_eq!(harness.cluster.calls("get_pod"), 1);
        assert_eq!(harness.cluster.calls("follow_log"), 1);
        assert!(!harness.dashboard.cancellations.contains(cancellations::POD_LOGS));
    }

    #[tokio::test(start_paused = true)]
    async fn log_follow_stops_when_selection_changes() {
        let mut harness =
            Harness::started(vec![running("p1", &["c1"]), running("p2", &["c1"])]).await;
        harness.dashboard.select_pod("p1");
        harness.settle().await;

        harness.close_log(0);
        harness.settle().await;
        harness.dashboard.select_pod("p2");
        harness.settle().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        harness.settle().await;

        assert_eq!(harness.cluster.calls("get_pod"), 0);
        assert_eq!(harness.cluster.calls("follow_log"), 2);
        assert_eq!(harness.cluster.state.lock().unwrap().log_since, vec![None, None]);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_watch_end_relists() {
        let mut harness = Harness::started(vec![running("p1", &["c1"])]).await;
        harness
            .cluster
            .state
            .lock()
            .unwrap()
            .watch
            .take()
            .expect("watch opened")
            .close_channel();
        harness.settle().await;

        assert_eq!(harness.cluster.calls("get_pods"), 2);
        assert_eq!(harness.cluster.calls("watch_pods"), 2);
        assert_eq!(harness.dashboard.sync_state(), SyncState::Watching);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_failure_backs_off_before_relisting() {
        let mut harness = Harness::started(vec![running("p1", &["c1"])]).await;
        {
            let mut state = harness.cluster.state.lock().unwrap();
            let watch = state.watch.as_mut().expect("watch opened");
            watch
                .try_send(Err(anyhow!(HttpFailure {
                    code: 500,
                    message: "etcd unavailable".to_string(),
                })))
                .unwrap();
        }
        harness.settle().await;
        assert_eq!(harness.dashboard.sync_state(), SyncState::Error);
        assert_eq!(harness.cluster.calls("get_pods"), 1);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        harness.settle().await;
        assert_eq!(harness.cluster.calls("get_pods"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminating_selected_pod_keeps_streams() {
        let mut harness = Harness::started(vec![running("p1", &["c1"])]).await;
        harness.dashboard.select_pod("p1");
        harness.settle().await;

        let mut terminating = running("p1", &["c1"]);
        terminating.deleting = true;
        harness.push_watch_event(WatchKind::Modified, terminating);
        harness.settle().await;

        assert_eq!(harness.dashboard.panel_state(), Some(&PanelState::Terminating));
        assert!(!harness.log_token(0).is_cancelled());
        assert!(harness.dashboard.selection().is_pod("p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn namespace_switch_ignores_stale_events() {
        let mut harness = Harness::started(vec![running("p1", &["c1"])]).await;
        let stale = DashboardEvent::Pod {
            generation: 1,
            event: PodEvent {
                kind: WatchKind::Added,
                pod: running("ghost", &["c1"]),
            },
        };
        harness.dashboard.switch_namespace("other");
        harness.dashboard.handle(stale);
        harness.settle().await;

        assert_eq!(harness.dashboard.namespace(), "other");
        assert!(harness.dashboard.pods().iter().all(|pod| pod.uid != "ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn shell_sessions_are_deduplicated_and_track_pod_deletion() {
        let mut harness = Harness::started(vec![running("p1", &["c1"])]).await;
        let first = harness.dashboard.open_shell("p1");
        harness.settle().await;
        let second = harness.dashboard.open_shell("p1");
        harness.settle().await;

        assert_eq!(first, second);
        assert_eq!(harness.cluster.calls("exec"), 1);
        assert_eq!(harness.cluster.calls("watch_pod"), 1);
        let session = first.unwrap();
        assert_eq!(
            harness.dashboard.sessions().get(session).map(|s| s.status),
            Some(SessionStatus::Running)
        );

        harness.dashboard.send_to_shell(session, b"ls\r".to_vec());
        {
            let mut state = harness.cluster.state.lock().unwrap();
            assert_eq!(state.shells[0].1.try_recv().ok(), Some(b"ls\r".to_vec()));
            state.pod_watches[0]
                .0
                .try_send(Ok(PodEvent {
                    kind: WatchKind::Deleted,
                    pod: running("p1", &["c1"]),
                }))
                .unwrap();
        }
        harness.settle().await;
        assert_eq!(
            harness.dashboard.sessions().get(session).map(|s| s.status),
            Some(SessionStatus::Deleted)
        );

        let watch_token = harness.cluster.state.lock().unwrap().pod_watches[0].1.clone();
        let shell = harness.cluster.state.lock().unwrap().shells.remove(0);
        drop(shell);
        harness.settle().await;

        assert!(harness.dashboard.sessions().is_empty());
        assert!(watch_token.is_cancelled());
        let exec_key = cancellations::exec_key(session);
        assert!(!harness.dashboard.cancellations.contains(&exec_key));
    }
}
