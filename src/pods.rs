use std::collections::HashMap;
use std::time::Duration;

use crate::model::{PodEvent, PodList, PodRecord, Selection, WatchKind};

#[derive(Debug, Default)]
pub struct PodMirror {
    pods: Vec<PodRecord>,
    index: HashMap<String, usize>,
    resource_version: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MirrorChange {
    Added(String),
    Replaced { uid: String, became_terminating: bool },
    Removed(String),
    Ignored,
}

impl PodMirror {
    pub fn replace_all(&mut self, list: PodList) {
        self.pods.clear();
        self.index.clear();
        self.resource_version = list.resource_version;
        for pod in list.items {
            self.upsert(pod);
        }
    }

    pub fn clear(&mut self) {
        self.pods.clear();
        self.index.clear();
        self.resource_version.clear();
    }

    pub fn apply(&mut self, event: PodEvent) -> MirrorChange {
        if let Some(version) = event.pod.resource_version.clone() {
            self.resource_version = version;
        }

        match event.kind {
            WatchKind::Added | WatchKind::Modified => {
                let uid = event.pod.uid.clone();
                match self.index.get(&uid).copied() {
                    Some(position) => {
                        let was_deleting = self.pods[position].deleting;
                        let became_terminating = !was_deleting && event.pod.deleting;
                        self.pods[position] = event.pod;
                        MirrorChange::Replaced {
                            uid,
                            became_terminating,
                        }
                    }
                    None => {
                        self.upsert(event.pod);
                        MirrorChange::Added(uid)
                    }
                }
            }
            WatchKind::Deleted => match self.remove(&event.pod.uid) {
                Some(removed) => MirrorChange::Removed(removed.uid),
                None => MirrorChange::Ignored,
            },
        }
    }

    pub fn get(&self, uid: &str) -> Option<&PodRecord> {
        self.index.get(uid).map(|position| &self.pods[*position])
    }

    pub fn pods(&self) -> &[PodRecord] {
        &self.pods
    }

    pub fn resource_version(&self) -> &str {
        &self.resource_version
    }

    fn upsert(&mut self, pod: PodRecord) {
        match self.index.get(&pod.uid) {
            Some(position) => self.pods[*position] = pod,
            None => {
                self.index.insert(pod.uid.clone(), self.pods.len());
                self.pods.push(pod);
            }
        }
    }

    fn remove(&mut self, uid: &str) -> Option<PodRecord> {
        let position = self.index.remove(uid)?;
        let removed = self.pods.remove(position);
        for (offset, pod) in self.pods.iter().enumerate().skip(position) {
            self.index.insert(pod.uid.clone(), offset);
        }
        Some(removed)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SelectionChange {
    Unchanged,
    Container(String),
    NoContainers,
}

/// Picks the container to show when `pod` is selected: the only container,
/// or the one after the current selection when there are several.
pub fn next_container(selection: &Selection, pod: &PodRecord) -> SelectionChange {
    let names = pod
        .containers
        .iter()
        .map(|container| container.name.as_str())
        .collect::<Vec<_>>();

    match names.as_slice() {
        [] => SelectionChange::NoContainers,
        [only] => {
            if selection.is_pod(&pod.uid) && selection.container.as_deref() == Some(*only) {
                SelectionChange::Unchanged
            } else {
                SelectionChange::Container(only.to_string())
            }
        }
        many => {
            let current = selection
                .is_pod(&pod.uid)
                .then(|| selection.container.as_deref())
                .flatten()
                .and_then(|name| many.iter().position(|candidate| *candidate == name));
            let next = current.map(|index| (index + 1) % many.len()).unwrap_or(0);
            SelectionChange::Container(many[next].to_string())
        }
    }
}

pub fn streams_allowed(pod: &PodRecord) -> bool {
    pod.is_running() || pod.is_terminating()
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SyncState {
    Idle,
    Listing,
    Watching,
    Error,
}

impl SyncState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listing => "listing",
            Self::Watching => "watching",
            Self::Error => "retrying",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial.min(max),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial.min(self.max);
    }
}
