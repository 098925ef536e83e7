use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILE: &str = ".sshx_config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine home directory")]
    NoHome,
    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This node's identity on the relay.
    pub id: String,
    /// Multiplexer port, bound on loopback.
    pub local_tcp_port: u16,
    pub local_ssh_port: u16,
    /// Direct-link listener; 0 picks a free port.
    pub direct_port: u16,
    pub signaling_server_addr: String,
    pub ice_servers: Vec<String>,
    /// Peer identity to `host:port` of its direct-link listener.
    pub direct_links: HashMap<String, String>,
    pub admission_poll_ms: u64,
    pub admission_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            local_tcp_port: 2224,
            local_ssh_port: 22,
            direct_port: 8099,
            signaling_server_addr: "http://127.0.0.1:11095".to_string(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            direct_links: HashMap::new(),
            admission_poll_ms: 500,
            admission_timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn admission_poll(&self) -> Duration {
        Duration::from_millis(self.admission_poll_ms.max(1))
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_secs(self.admission_timeout_secs)
    }

    /// Reads `path`, writing a default file first when it does not exist.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Config::default();
            config.save(path)?;
            return Ok(config);
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let serialized = toml::to_string_pretty(self)?;
        fs::write(path, serialized).map_err(io_err)
    }
}

/// `$SSHX_HOME`, or the user's home directory.
pub fn home_dir() -> Result<PathBuf, ConfigError> {
    if let Some(home) = env::var_os("SSHX_HOME").filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    BaseDirs::new()
        .map(|base| base.home_dir().to_path_buf())
        .ok_or(ConfigError::NoHome)
}

pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(home_dir()?.join(CONFIG_FILE))
}

pub fn debug_enabled() -> bool {
    env::var("SSHX_DEBUG")
        .map(|value| !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let first = Config::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(first.local_tcp_port, 2224);
        assert_eq!(first.signaling_server_addr, "http://127.0.0.1:11095");

        let second = Config::load_or_init(&path).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            "id = \"node-a\"\nlocal_ssh_port = 2222\n[direct_links]\nnode-b = \"10.0.0.2:8099\"\n",
        )
        .unwrap();

        let config = Config::load_or_init(&path).unwrap();
        assert_eq!(config.id, "node-a");
        assert_eq!(config.local_ssh_port, 2222);
        assert_eq!(config.direct_port, 8099);
        assert_eq!(config.direct_links["node-b"], "10.0.0.2:8099");
        assert_eq!(config.admission_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "local_tcp_port = \"many\"").unwrap();
        assert!(matches!(
            Config::load_or_init(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn home_and_debug_come_from_the_environment() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        unsafe {
            env::set_var("SSHX_HOME", dir.path());
            env::set_var("SSHX_DEBUG", "0");
        }
        assert_eq!(config_path().unwrap(), dir.path().join(CONFIG_FILE));
        assert!(!debug_enabled());

        unsafe {
            env::set_var("SSHX_DEBUG", "1");
        }
        assert!(debug_enabled());

        unsafe {
            env::remove_var("SSHX_HOME");
            env::remove_var("SSHX_DEBUG");
        }
    }
}
