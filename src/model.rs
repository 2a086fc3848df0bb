use chrono::{DateTime, Utc};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ResourceLimits {
    pub memory_bytes: Option<u64>,
    pub cpu_millicores: Option<u64>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ContainerInfo {
    pub name: String,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PodRecord {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub phase: String,
    pub deleting: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub node_name: Option<String>,
    pub resource_version: Option<String>,
    pub containers: Vec<ContainerInfo>,
}

impl PodRecord {
    pub fn is_running(&self) -> bool {
        self.phase.eq_ignore_ascii_case("Running")
    }

    pub fn is_terminating(&self) -> bool {
        self.deleting
    }

    pub fn container(&self, name: &str) -> Option<&ContainerInfo> {
        self.containers
            .iter()
            .find(|container| container.name == name)
    }

    pub fn status_label(&self) -> String {
        if self.deleting {
            "Terminating".to_string()
        } else {
            self.phase.clone()
        }
    }

    pub fn panel_state(&self) -> PanelState {
        if self.deleting {
            PanelState::Terminating
        } else if self.is_running() {
            PanelState::Running
        } else {
            PanelState::Phase(self.phase.clone())
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> String {
        let Some(since) = self.start_time.or(self.created_at) else {
            return "-".to_string();
        };
        format_elapsed_seconds((now - since).num_seconds().max(0))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WatchKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PodEvent {
    pub kind: WatchKind,
    pub pod: PodRecord,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PodList {
    pub resource_version: String,
    pub items: Vec<PodRecord>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PanelState {
    Running,
    Terminating,
    Deleted,
    Phase(String),
}

impl Display for PanelState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Terminating => write!(f, "TERMINATING"),
            Self::Deleted => write!(f, "DELETED"),
            Self::Phase(phase) => write!(f, "{phase}"),
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Selection {
    pub pod: Option<String>,
    pub container: Option<String>,
    pub epoch: u64,
}

impl Selection {
    pub fn is_pod(&self, uid: &str) -> bool {
        self.pod.as_deref() == Some(uid)
    }

    pub fn select(&mut self, uid: String, container: String) -> u64 {
        self.pod = Some(uid);
        self.container = Some(container);
        self.epoch += 1;
        self.epoch
    }

    pub fn clear(&mut self) {
        self.pod = None;
        self.container = None;
        self.epoch += 1;
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NetworkSample {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub memory_usage: u64,
    pub memory_cache: u64,
    pub cpu_user: u64,
    pub cpu_total: u64,
    pub network: Option<NetworkSample>,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct StatsSpec {
    pub memory_limit: Option<u64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<u64>,
    pub has_network: bool,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ContainerStats {
    pub samples: Vec<MetricSample>,
    pub spec: StatsSpec,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StatsTarget {
    pub node: String,
    pub namespace: String,
    pub pod: String,
    pub uid: String,
    pub container: String,
}

pub fn format_elapsed_seconds(seconds: i64) -> String {
    const UNITS: [(i64, char); 3] = [(86_400, 'd'), (3_600, 'h'), (60, 'm')];
    UNITS
        .iter()
        .find(|(size, _)| seconds >= *size)
        .map(|(size, unit)| format!("{}{unit}", seconds / size))
        .unwrap_or_else(|| format!("{seconds}s"))
}


#[cfg(test)]
mod tests {
    use super::fixtures::pod;
    use super::{PanelState, Selection, format_elapsed_seconds};
    use chrono::{Duration, Utc};

    #[test]
    fn elapsed_seconds_use_largest_unit() {
        assert_eq!(format_elapsed_seconds(42), "42s");
        assert_eq!(format_elapsed_seconds(125), "2m");
        assert_eq!(format_elapsed_seconds(7_300), "2h");
        assert_eq!(format_elapsed_seconds(200_000), "2d");
    }

    #[test]
    fn panel_state_prefers_terminating_over_phase() {
        let mut record = pod("u1", "api", "Running", &["app"]);
        assert_eq!(record.panel_state(), PanelState::Running);
        record.deleting = true;
        assert_eq!(record.panel_state(), PanelState::Terminating);
        assert_eq!(record.status_label(), "Terminating");
        assert_eq!(PanelState::Deleted.to_string(), "DELETED");
    }

    #[test]
    fn age_counts_from_start_time_then_creation_time() {
        let now = Utc::now();
        let mut record = pod("u1", "api", "Running", &["app"]);
        assert_eq!(record.age(now), "-");
        record.created_at = Some(now - Duration::seconds(7_300));
        assert_eq!(record.age(now), "2h");
        record.start_time = Some(now - Duration::seconds(90));
        assert_eq!(record.age(now), "1m");
    }

    #[test]
    fn every_selection_change_bumps_the_epoch() {
        let mut selection = Selection::default();
        let first = selection.select("u1".to_string(), "app".to_string());
        selection.clear();
        let second = selection.select("u1".to_string(), "app".to_string());
        assert!(second > first + 1);
        assert!(selection.is_pod("u1"));
    }
}
