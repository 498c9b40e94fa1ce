use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use clap::Parser;
use hive_protocol::{DEFAULT_JOB_TIMEOUT_SECS, paths};
use libhive::OverflowPolicy;
use libhive::fanout::DEFAULT_EVENT_BUFFER;
use libhive::tasks::{DEFAULT_DEBOUNCE, DEFAULT_TASK_FILE_NAME, TaskSource};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub const DEFAULT_LISTEN: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8787);
pub const DEFAULT_ORIGIN: &str = "http://localhost:3000";
pub const DEFAULT_KEEPALIVE_SECS: u64 = 15;

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "hive web gateway: jobs, events, terminals and tasks")]
pub struct Args {
    /// TOML config file (defaults to ~/.config/hive/config.toml when present).
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub listen: Option<SocketAddr>,
    /// Redis URL; without one an in-process store is used.
    #[arg(long, env = "HIVE_REDIS_URL")]
    pub redis_url: Option<String>,
    /// Allowed CORS origin; repeatable, `*` allows any.
    #[arg(long = "allow-origin")]
    pub allow_origins: Vec<String>,
    #[arg(long)]
    pub job_timeout_secs: Option<u64>,
    #[arg(long)]
    pub keepalive_secs: Option<u64>,
    /// Per-subscriber event buffer.
    #[arg(long)]
    pub event_buffer: Option<usize>,
    /// drop_subscriber | evict_oldest
    #[arg(long)]
    pub overflow_policy: Option<OverflowPolicy>,
    /// Explicit task document; disables searching.
    #[arg(long)]
    pub task_file: Option<PathBuf>,
    #[arg(long)]
    pub task_search_dir: Option<PathBuf>,
    #[arg(long)]
    pub task_file_name: Option<String>,
    #[arg(long)]
    pub debounce_ms: Option<u64>,
    /// Shell for local terminals (defaults to $SHELL).
    #[arg(long)]
    pub shell: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub listen: Option<SocketAddr>,
    pub redis_url: Option<String>,
    pub allow_origins: Option<Vec<String>>,
    pub job_timeout_secs: Option<u64>,
    pub keepalive_secs: Option<u64>,
    pub event_buffer: Option<usize>,
    pub overflow_policy: Option<OverflowPolicy>,
    pub task_file: Option<PathBuf>,
    pub task_search_dir: Option<PathBuf>,
    pub task_file_name: Option<String>,
    pub debounce_ms: Option<u64>,
    pub shell: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: SocketAddr,
    pub redis_url: Option<String>,
    pub allow_origins: Vec<String>,
    pub job_timeout: Duration,
    pub keepalive: Duration,
    pub event_buffer: usize,
    pub overflow_policy: OverflowPolicy,
    pub task_source: TaskSource,
    pub debounce: Duration,
    pub shell: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        resolve(&Args::default(), FileConfig::default())
    }
}

pub fn load_runtime_config(args: &Args) -> Result<RuntimeConfig> {
    let file_cfg = match &args.config {
        Some(path) => read_file_config(path)?,
        None => {
            let default_path = paths::config_path();
            if default_path.exists() {
                read_file_config(&default_path)?
            } else {
                FileConfig::default()
            }
        }
    };
    Ok(resolve(args, file_cfg))
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str::<FileConfig>(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))
}

/// Flag beats file beats default.
pub fn resolve(args: &Args, file_cfg: FileConfig) -> RuntimeConfig {
    let listen = args
        .listen
        .or(file_cfg.listen)
        .unwrap_or(DEFAULT_LISTEN);

    let allow_origins = if !args.allow_origins.is_empty() {
        args.allow_origins.clone()
    } else {
        file_cfg
            .allow_origins
            .unwrap_or_else(|| vec![DEFAULT_ORIGIN.to_string()])
    };

    let task_file_name = args
        .task_file_name
        .clone()
        .or(file_cfg.task_file_name)
        .unwrap_or_else(|| DEFAULT_TASK_FILE_NAME.to_string());
    let task_source = match args.task_file.clone().or(file_cfg.task_file) {
        Some(path) => TaskSource::explicit(path),
        None => TaskSource::search(
            args.task_search_dir
                .clone()
                .or(file_cfg.task_search_dir)
                .unwrap_or_else(paths::default_task_search_root),
            task_file_name,
        ),
    };

    RuntimeConfig {
        listen,
        redis_url: args.redis_url.clone().or(file_cfg.redis_url),
        allow_origins,
        job_timeout: Duration::from_secs(
            args.job_timeout_secs
                .or(file_cfg.job_timeout_secs)
                .unwrap_or(DEFAULT_JOB_TIMEOUT_SECS),
        ),
        keepalive: Duration::from_secs(
            args.keepalive_secs
                .or(file_cfg.keepalive_secs)
                .unwrap_or(DEFAULT_KEEPALIVE_SECS)
                .max(1),
        ),
        event_buffer: args
            .event_buffer
            .or(file_cfg.event_buffer)
            .unwrap_or(DEFAULT_EVENT_BUFFER),
        overflow_policy: args
            .overflow_policy
            .or(file_cfg.overflow_policy)
            .unwrap_or_default(),
        task_source,
        debounce: args
            .debounce_ms
            .or(file_cfg.debounce_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_DEBOUNCE),
        shell: args
            .shell
            .clone()
            .or(file_cfg.shell)
            .unwrap_or_else(paths::default_shell),
    }
}

pub fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    let methods = [Method::GET, Method::POST, Method::PUT, Method::OPTIONS];
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid --allow-origin value: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods(methods)
        .allow_headers(Any))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_flags_or_file() {
        let cfg = resolve(&Args::default(), FileConfig::default());
        assert_eq!(cfg.listen, DEFAULT_LISTEN);
        assert_eq!(cfg.listen.to_string(), "127.0.0.1:8787");
        assert_eq!(cfg.allow_origins, vec![DEFAULT_ORIGIN]);
        assert_eq!(cfg.job_timeout, Duration::from_secs(60));
        assert_eq!(cfg.keepalive, Duration::from_secs(15));
        assert_eq!(cfg.overflow_policy, OverflowPolicy::DropSubscriber);
        assert_eq!(cfg.task_source.explicit, None);
        assert_eq!(cfg.task_source.file_name, "task.md");
        assert!(cfg.redis_url.is_none());
    }

    #[test]
    fn flags_beat_file_values() {
        let file_cfg: FileConfig = toml::from_str(
            r#"
            listen = "0.0.0.0:9000"
            job_timeout_secs = 5
            overflow_policy = "evict_oldest"
            allow_origins = ["https://dash.example"]
            task_search_dir = "/srv/brain"
            "#,
        )
        .unwrap();
        let args = Args::parse_from([
            "hive-web",
            "--job-timeout-secs",
            "9",
            "--task-file",
            "/tmp/plan.md",
        ]);

        let cfg = resolve(&args, file_cfg);
        assert_eq!(cfg.listen.to_string(), "0.0.0.0:9000");
        assert_eq!(cfg.job_timeout, Duration::from_secs(9));
        assert_eq!(cfg.overflow_policy, OverflowPolicy::EvictOldest);
        assert_eq!(cfg.allow_origins, vec!["https://dash.example"]);
        assert_eq!(cfg.task_source.explicit, Some(PathBuf::from("/tmp/plan.md")));
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        assert!(toml::from_str::<FileConfig>("lisen = \"x\"").is_err());
    }

    #[test]
    fn config_file_is_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(&path, "keepalive_secs = 3\nshell = \"/bin/zsh\"\n").unwrap();

        let args = Args::parse_from(["hive-web", "--config", path.to_str().unwrap()]);
        let cfg = load_runtime_config(&args).unwrap();
        assert_eq!(cfg.keepalive, Duration::from_secs(3));
        assert_eq!(cfg.shell, "/bin/zsh");

        let missing = Args::parse_from(["hive-web", "--config", "/nonexistent/hive.toml"]);
        assert!(load_runtime_config(&missing).is_err());
    }

    #[test]
    fn build_cors_accepts_wildcard_and_rejects_garbage() {
        assert!(build_cors(&["*".to_string()]).is_ok());
        assert!(build_cors(&["http://localhost:3000".to_string()]).is_ok());
        assert!(build_cors(&["bad\norigin".to_string()]).is_err());
    }
}
