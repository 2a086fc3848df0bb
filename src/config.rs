use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SHELL: [&str; 3] = [
    "/bin/sh",
    "-c",
    "command -v bash >/dev/null && exec bash || exec sh",
];

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardSettings {
    pub log_flush: Duration,
    pub log_reconnect: Duration,
    pub log_buffer_lines: usize,
    pub stats_interval: Duration,
    pub age_refresh: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub shell: Vec<String>,
    pub source: Option<String>,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        DashboardConfigFile::default().into_settings(None)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DashboardConfigFile {
    #[serde(alias = "log_flush")]
    log_flush_ms: u64,
    #[serde(alias = "log_reconnect")]
    log_reconnect_ms: u64,
    log_buffer_lines: usize,
    #[serde(alias = "stats_interval")]
    stats_interval_secs: u64,
    #[serde(alias = "age_refresh")]
    age_refresh_secs: u64,
    #[serde(alias = "retry_backoff_max")]
    retry_backoff_max_secs: u64,
    shell: Vec<String>,
}

impl Default for DashboardConfigFile {
    fn default() -> Self {
        Self {
            log_flush_ms: 100,
            log_reconnect_ms: 1_000,
            log_buffer_lines: 2_000,
            stats_interval_secs: 10,
            age_refresh_secs: 1,
            retry_backoff_max_secs: 30,
            shell: DEFAULT_SHELL.iter().map(|part| part.to_string()).collect(),
        }
    }
}

impl DashboardConfigFile {
    fn into_settings(self, source: Option<String>) -> DashboardSettings {
        let shell = if self.shell.iter().all(|part| part.trim().is_empty()) {
            DEFAULT_SHELL.iter().map(|part| part.to_string()).collect()
        } else {
            self.shell
        };

        DashboardSettings {
            log_flush: Duration::from_millis(self.log_flush_ms.max(10)),
            log_reconnect: Duration::from_millis(self.log_reconnect_ms),
            log_buffer_lines: self.log_buffer_lines.max(1),
            stats_interval: Duration::from_secs(self.stats_interval_secs.max(1)),
            age_refresh: Duration::from_secs(self.age_refresh_secs.max(1)),
            retry_initial: Duration::from_secs(1),
            retry_max: Duration::from_secs(self.retry_backoff_max_secs.max(1)),
            shell,
            source,
        }
    }
}

impl DashboardSettings {
    /// Loads settings from `explicit`, or from the first config file found in
    /// the usual places. No file means defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => discover_config_path(),
        };
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&raw, Some(path.display().to_string()))
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    fn parse(raw: &str, source: Option<String>) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(DashboardConfigFile::default().into_settings(source));
        }
        let parsed: DashboardConfigFile = serde_yaml::from_str(raw)?;
        Ok(parsed.into_settings(source))
    }
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("PODSCOPE_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [
        PathBuf::from("podscope.yaml"),
        PathBuf::from("podscope.yml"),
        PathBuf::from(".podscope.yaml"),
    ];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let user_candidates = [
            PathBuf::from(&home).join(".config/podscope/config.yaml"),
            PathBuf::from(&home).join(".config/podscope/config.yml"),
        ];
        for candidate in user_candidates {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_SHELL, DashboardSettings};
    use std::time::Duration;

    #[test]
    fn defaults_match_dashboard_cadence() {
        let settings = DashboardSettings::default();
        assert_eq!(settings.log_flush, Duration::from_millis(100));
        assert_eq!(settings.log_reconnect, Duration::from_secs(1));
        assert_eq!(settings.stats_interval, Duration::from_secs(10));
        assert_eq!(settings.age_refresh, Duration::from_secs(1));
        assert_eq!(settings.retry_max, Duration::from_secs(30));
        assert_eq!(settings.log_buffer_lines, 2_000);
        assert_eq!(settings.shell, DEFAULT_SHELL.to_vec());
        assert_eq!(settings.source, None);
    }

    #[test]
    fn partial_yaml_overrides_only_given_keys() {
        let settings = DashboardSettings::parse(
            "stats_interval_secs: 5\nshell: [\"/bin/bash\", \"-l\"]\nlog_buffer_lines: 0\n",
            Some("podscope.yaml".to_string()),
        )
        .unwrap();

        assert_eq!(settings.stats_interval, Duration::from_secs(5));
        assert_eq!(settings.shell, vec!["/bin/bash", "-l"]);
        assert_eq!(settings.log_buffer_lines, 1);
        assert_eq!(settings.log_flush, Duration::from_millis(100));
        assert_eq!(settings.source.as_deref(), Some("podscope.yaml"));
    }

    #[test]
    fn empty_file_and_unknown_keys() {
        assert_eq!(
            DashboardSettings::parse("  \n", None).unwrap(),
            DashboardSettings::default()
        );
        assert!(DashboardSettings::parse("refresh_ms: 10\n", None).is_err());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let error = DashboardSettings::load(Some(std::path::Path::new(
            "/nonexistent/podscope.yaml",
        )))
        .unwrap_err();
        assert!(format!("{error:#}").contains("failed to read config"));
    }
}
