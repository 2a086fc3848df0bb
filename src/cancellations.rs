use anyhow::Result;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{debug, warn};

pub type Cleanup = Box<dyn FnOnce() -> Result<()> + Send>;

pub const DASHBOARD: &str = "dashboard";
pub const PODS_WATCH: &str = "dashboard.pods";
pub const REFRESH_POD_AGES: &str = "dashboard.refreshPodAges";
pub const POD: &str = "dashboard.pod";
pub const POD_LOGS: &str = "dashboard.pod.logs";
pub const POD_LOGS_FLUSH: &str = "dashboard.pod.logs.flush";
pub const POD_STATS: &str = "dashboard.pod.stats";

pub fn exec_key(session: u64) -> String {
    format!("exec.{session}")
}

pub fn exec_watch_key(session: u64) -> String {
    format!("exec.{session}.watch")
}

struct Entry {
    key: String,
    cleanup: Cleanup,
}

/// Cleanup actions registered under dot-delimited keys.
///
/// Running a key also runs every key below it in the hierarchy, so
/// `run("dashboard.pod")` releases `dashboard.pod.logs` and
/// `dashboard.pod.stats` but leaves `dashboard.pods` alone. Each action is
/// invoked at most once, in registration order.
#[derive(Default)]
pub struct Cancellations {
    entries: Vec<Entry>,
}

impl Cancellations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, key: impl Into<String>, cleanup: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.entries.push(Entry {
            key: key.into(),
            cleanup: Box::new(cleanup),
        });
    }

    /// Runs whatever is registered at exactly `key`, then stores `cleanup` there.
    pub fn replace<F>(&mut self, key: impl Into<String>, cleanup: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let key = key.into();
        let previous = self.take_matching(|entry_key| entry_key == key);
        invoke_all(previous);
        self.add(key, cleanup);
    }

    pub fn run(&mut self, key: &str) -> usize {
        let matched = self.take_matching(|entry_key| covers(key, entry_key));
        if !matched.is_empty() {
            debug!(key, count = matched.len(), "running cancellations");
        }
        invoke_all(matched)
    }

    pub fn run_all(&mut self) -> usize {
        let entries = std::mem::take(&mut self.entries);
        invoke_all(entries)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|entry| covers(key, &entry.key))
    }

    fn take_matching(&mut self, mut predicate: impl FnMut(&str) -> bool) -> Vec<Entry> {
        let mut matched = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if predicate(&entry.key) {
                matched.push(entry);
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        matched
    }
}

fn covers(prefix: &str, key: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

fn invoke_all(entries: Vec<Entry>) -> usize {
    let count = entries.len();
    for Entry { key, cleanup } in entries {
        match catch_unwind(AssertUnwindSafe(cleanup)) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(key = %key, "cleanup failed: {error:#}"),
            Err(_) => warn!(key = %key, "cleanup panicked"),
        }
    }
    count
}
