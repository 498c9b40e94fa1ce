use std::path::PathBuf;

/// Returns the config directory for hive.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("hive")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("hive")
    } else {
        PathBuf::from("/tmp/hive")
    }
}

/// Returns the config file path shared by the hive binaries.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}

/// Returns the default config file path for `hive-worker`.
pub fn worker_config_path() -> PathBuf {
    dirs_path().join("worker.toml")
}

/// Directory tree searched for the newest task document when no explicit
/// path is synced.
pub fn default_task_search_root() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home)
            .join(".gemini")
            .join("antigravity")
            .join("brain"),
        Err(_) => PathBuf::from("/tmp/hive/brain"),
    }
}

/// Shell spawned for local terminal sessions.
pub fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}
