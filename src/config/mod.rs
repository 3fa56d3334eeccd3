use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Once;
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_MODEL: &str = "qwen2.5-coder";
const DEFAULT_CONFIG_PATH: &str = "config/agent.toml";
const DEFAULT_MAX_TURNS: usize = 32;

static ENV_LOADER: Once = Once::new();

/// Loads environment variables from config/.env once per process.
pub fn ensure_env_loaded() {
    ENV_LOADER.call_once(|| {
        let _ = dotenvy::from_filename("config/.env");
    });
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_turns: usize,
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("duplicate server name in config: {0}")]
    DuplicateServer(String),
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    model: Option<String>,
    system_prompt: Option<String>,
    max_turns: Option<usize>,
    #[serde(default)]
    servers: Vec<RawServer>,
}

/// Launch description for one capability server. Identified by a unique
/// name; immutable once connected. A changed config is handled by a full
/// disconnect and reconnect, never by in-place mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerConfig {
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub workdir: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub auto_reconnect: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RawServer {
    name: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    workdir: Option<String>,
    timeout_secs: Option<u64>,
    #[serde(default)]
    auto_reconnect: bool,
}

impl From<RawServer> for ServerConfig {
    fn from(raw: RawServer) -> Self {
        let expand = |s: &str| -> String {
            shellexpand::full(s)
                .map(|cow| cow.into_owned())
                .unwrap_or_else(|_| s.to_string())
        };

        Self {
            name: raw.name,
            command: PathBuf::from(expand(&raw.command)),
            args: raw.args.iter().map(|arg| expand(arg)).collect(),
            env: raw.env,
            workdir: raw.workdir.map(|d| PathBuf::from(expand(&d))),
            timeout_secs: raw.timeout_secs,
            auto_reconnect: raw.auto_reconnect,
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        ensure_env_loaded();
        if let Some(path) = path {
            return read_config(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        match read_config(default_path) {
            Ok(config) => Ok(config),
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!("Configuration file not found; using defaults");
                Ok(Self::default())
            }
            Err(other) => Err(other),
        }
    }

    pub fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            system_prompt: None,
            max_turns: DEFAULT_MAX_TURNS,
            servers: Vec::new(),
        }
    }

    /// Server configs keyed by name; the reload target set is derived from
    /// this map.
    pub fn servers_by_name(&self) -> HashMap<String, ServerConfig> {
        self.servers
            .iter()
            .cloned()
            .map(|cfg| (cfg.name.clone(), cfg))
            .collect()
    }
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    debug!(path = %path.display(), "Reading runtime configuration file");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let servers: Vec<ServerConfig> = parsed.servers.into_iter().map(ServerConfig::from).collect();
    let mut seen = std::collections::HashSet::new();
    for server in &servers {
        if !seen.insert(server.name.clone()) {
            return Err(ConfigError::DuplicateServer(server.name.clone()));
        }
    }

    Ok(AppConfig {
        model: parsed.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        system_prompt: parsed.system_prompt,
        max_turns: parsed.max_turns.unwrap_or(DEFAULT_MAX_TURNS),
        servers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn returns_default_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.toml");
        let err = AppConfig::load(Some(&path)).expect_err("missing file errors");
        assert!(matches!(err, ConfigError::Io { .. }));

        let config = AppConfig::default();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.max_turns, DEFAULT_MAX_TURNS);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn reads_model_and_turn_budget() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.toml");
        let mut file = File::create(&path).expect("create config");
        writeln!(
            file,
            r#"
model = "mistral"
system_prompt = "keep short"
max_turns = 5
"#
        )
        .expect("write");

        let config = AppConfig::load(Some(&path)).expect("load config");
        assert_eq!(config.model, "mistral");
        assert_eq!(config.system_prompt.as_deref(), Some("keep short"));
        assert_eq!(config.max_turns, 5);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn reads_server_definitions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.toml");
        fs::write(
            &path,
            r#"
[[servers]]
name = "files"
command = "/usr/local/bin/files-server"
args = ["--root", "/tmp"]
timeout_secs = 20
auto_reconnect = true

[[servers]]
name = "git"
command = "/usr/local/bin/git-server"
"#,
        )
        .expect("write servers config");

        let config = AppConfig::load(Some(&path)).expect("load");
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].name, "files");
        assert_eq!(config.servers[0].args, vec!["--root", "/tmp"]);
        assert_eq!(config.servers[0].timeout_secs, Some(20));
        assert!(config.servers[0].auto_reconnect);
        assert_eq!(config.servers[1].name, "git");
        assert!(!config.servers[1].auto_reconnect);

        let by_name = config.servers_by_name();
        assert!(by_name.contains_key("files"));
        assert!(by_name.contains_key("git"));
    }

    #[test]
    fn rejects_duplicate_server_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.toml");
        fs::write(
            &path,
            r#"
[[servers]]
name = "files"
command = "a"

[[servers]]
name = "files"
command = "b"
"#,
        )
        .expect("write");

        let err = AppConfig::load(Some(&path)).expect_err("duplicate rejected");
        assert!(matches!(err, ConfigError::DuplicateServer(name) if name == "files"));
    }
}
