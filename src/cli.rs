use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "podscope",
    version,
    about = "A live terminal dashboard for the pods of one Kubernetes namespace."
)]
pub struct CliArgs {
    /// Namespace to watch (defaults to the kubeconfig context's namespace)
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// kubeconfig context to use instead of the current one
    #[arg(long)]
    pub context: Option<String>,

    /// Dashboard settings file (YAML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, default_value = "info")]
    pub log_filter: String,

    /// Write logs to this file; logs are discarded otherwise
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::CliArgs;
    use clap::Parser;

    #[test]
    fn defaults_leave_namespace_to_kubeconfig() {
        let args = CliArgs::parse_from(["podscope"]);
        assert_eq!(args.namespace, None);
        assert_eq!(args.log_filter, "info");
        assert!(args.log_file.is_none());
    }

    #[test]
    fn short_flags_parse() {
        let args = CliArgs::parse_from(["podscope", "-n", "kube-system", "-c", "dash.yaml"]);
        assert_eq!(args.namespace.as_deref(), Some("kube-system"));
        assert_eq!(
            args.config.as_deref(),
            Some(std::path::Path::new("dash.yaml"))
        );
    }
}
