use anyhow::{Context, Result, bail};
use clap::Parser;
use hive_protocol::paths;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_WORKER_TYPE: &str = "GEMINI";
/// Slightly under the dispatcher's deadline so a slow job still gets an
/// explicit error reply instead of a dispatcher-side timeout.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 55;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 60;

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "hive reference worker: runs a CLI agent for each job")]
pub struct Args {
    /// TOML config file (defaults to ~/.config/hive/worker.toml when present).
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, env = "HIVE_AGENT_ID")]
    pub agent_id: Option<String>,
    /// Job channel to consume, e.g. GEMINI or CLAUDE.
    #[arg(long)]
    pub worker_type: Option<String>,
    #[arg(long, env = "HIVE_REDIS_URL")]
    pub redis_url: Option<String>,
    #[arg(long)]
    pub max_concurrency: Option<usize>,
    #[arg(long)]
    pub job_timeout_secs: Option<u64>,
    #[arg(long)]
    pub heartbeat_secs: Option<u64>,
    /// Agent command and arguments; job content is written to its stdin.
    #[arg(last = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub agent_id: Option<String>,
    pub worker_type: Option<String>,
    pub redis_url: Option<String>,
    pub command: Option<Vec<String>>,
    pub max_concurrency: Option<usize>,
    pub job_timeout_secs: Option<u64>,
    pub heartbeat_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub agent_id: String,
    pub worker_type: String,
    pub redis_url: Option<String>,
    pub program: String,
    pub args: Vec<String>,
    pub max_concurrency: usize,
    pub job_timeout: Duration,
    pub heartbeat: Duration,
}

pub fn load_runtime_config(args: &Args) -> Result<RuntimeConfig> {
    let file_cfg = match &args.config {
        Some(path) => read_file_config(path)?,
        None => {
            let default_path = paths::worker_config_path();
            if default_path.exists() {
                read_file_config(&default_path)?
            } else {
                FileConfig::default()
            }
        }
    };
    resolve(args, file_cfg)
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str::<FileConfig>(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))
}

pub fn resolve(args: &Args, file_cfg: FileConfig) -> Result<RuntimeConfig> {
    let worker_type = args
        .worker_type
        .clone()
        .or(file_cfg.worker_type)
        .unwrap_or_else(|| DEFAULT_WORKER_TYPE.to_string())
        .to_ascii_uppercase();
    if worker_type.is_empty() {
        bail!("worker type must not be empty");
    }

    let agent_id = args
        .agent_id
        .clone()
        .or(file_cfg.agent_id)
        .unwrap_or_else(|| {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("{}-{}", worker_type.to_ascii_lowercase(), &suffix[..8])
        });

    let mut command = if args.command.is_empty() {
        file_cfg
            .command
            .unwrap_or_else(|| vec![worker_type.to_ascii_lowercase()])
    } else {
        args.command.clone()
    };
    if command.is_empty() || command[0].is_empty() {
        bail!("agent command must not be empty");
    }
    let program = command.remove(0);

    let max_concurrency = args.max_concurrency.or(file_cfg.max_concurrency).unwrap_or(1);
    if max_concurrency == 0 {
        bail!("max_concurrency must be at least 1");
    }

    Ok(RuntimeConfig {
        agent_id,
        worker_type,
        redis_url: args.redis_url.clone().or(file_cfg.redis_url),
        program,
        args: command,
        max_concurrency,
        job_timeout: Duration::from_secs(
            args.job_timeout_secs
                .or(file_cfg.job_timeout_secs)
                .unwrap_or(DEFAULT_JOB_TIMEOUT_SECS),
        ),
        heartbeat: Duration::from_secs(
            args.heartbeat_secs
                .or(file_cfg.heartbeat_secs)
                .unwrap_or(DEFAULT_HEARTBEAT_SECS)
                .max(1),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_derive_from_worker_type() {
        let cfg = resolve(&Args::default(), FileConfig::default()).unwrap();
        assert_eq!(cfg.worker_type, "GEMINI");
        assert_eq!(cfg.program, "gemini");
        assert!(cfg.args.is_empty());
        assert!(cfg.agent_id.starts_with("gemini-"));
        assert_eq!(cfg.max_concurrency, 1);
        assert_eq!(cfg.job_timeout, Duration::from_secs(55));
        assert_eq!(cfg.heartbeat, Duration::from_secs(60));
        assert_eq!(cfg.redis_url, None);
    }

    #[test]
    fn flags_override_file() {
        let file_cfg: FileConfig = toml::from_str(
            r#"
            agent_id = "claude-box"
            worker_type = "claude"
            command = ["claude", "-p"]
            max_concurrency = 4
            "#,
        )
        .unwrap();
        let args = Args {
            agent_id: Some("claude-cli".into()),
            command: vec!["my-agent".into(), "--quiet".into()],
            ..Args::default()
        };
        let cfg = resolve(&args, file_cfg).unwrap();
        assert_eq!(cfg.agent_id, "claude-cli");
        assert_eq!(cfg.worker_type, "CLAUDE");
        assert_eq!(cfg.program, "my-agent");
        assert_eq!(cfg.args, vec!["--quiet".to_string()]);
        assert_eq!(cfg.max_concurrency, 4);
    }

    #[test]
    fn rejects_zero_concurrency_and_empty_command() {
        let args = Args {
            max_concurrency: Some(0),
            ..Args::default()
        };
        assert!(resolve(&args, FileConfig::default()).is_err());

        let file_cfg = FileConfig {
            command: Some(Vec::new()),
            ..FileConfig::default()
        };
        assert!(resolve(&Args::default(), file_cfg).is_err());
    }

    #[test]
    fn reads_config_file_and_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(&path, "worker_type = \"chatgpt\"\nheartbeat_secs = 5\n").unwrap();
        let args = Args {
            config: Some(path.clone()),
            ..Args::default()
        };
        let cfg = load_runtime_config(&args).unwrap();
        assert_eq!(cfg.worker_type, "CHATGPT");
        assert_eq!(cfg.heartbeat, Duration::from_secs(5));

        std::fs::write(&path, "listen = \"127.0.0.1:1\"\n").unwrap();
        assert!(load_runtime_config(&args).is_err());
    }
}
