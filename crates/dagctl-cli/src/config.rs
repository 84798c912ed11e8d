//! Configuration file management for dagctl.
//!
//! Provides a TOML-based config file at `~/.config/dagctl/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use dagctl_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub coordinator: CoordinatorSection,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct CoordinatorSection {
    /// Address a worker or CLI client dials to reach the coordinator.
    pub addr: Option<String>,
    /// Address the coordinator binds its gRPC listener to.
    pub listen_addr: Option<String>,
    /// Server TLS certificate/key, PEM-encoded. Both required for TLS.
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Client CA bundle. Presence requires mTLS on incoming connections.
    pub client_ca: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the dagctl config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/dagctl` or `~/.config/dagctl`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("dagctl");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("dagctl")
}

/// Return the path to the dagctl config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct DagctlConfig {
    pub db_config: DbConfig,
    pub coordinator_addr: String,
    pub listen_addr: String,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub client_ca: Option<String>,
}

const DEFAULT_COORDINATOR_ADDR: &str = "http://127.0.0.1:7800";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:7800";

impl DagctlConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - DB URL: `cli_db_url` > `DAGCTL_DATABASE_URL` env > `config_file.database.url` > `DbConfig::DEFAULT_URL`
    /// - Coordinator dial address: `DAGCTL_COORDINATOR_ADDR` env > config file > built-in default
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("DAGCTL_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let coordinator = file_config.as_ref().map(|c| &c.coordinator);

        let coordinator_addr = std::env::var("DAGCTL_COORDINATOR_ADDR")
            .ok()
            .or_else(|| coordinator.and_then(|c| c.addr.clone()))
            .unwrap_or_else(|| DEFAULT_COORDINATOR_ADDR.to_string());

        let listen_addr = std::env::var("DAGCTL_COORDINATOR_LISTEN_ADDR")
            .ok()
            .or_else(|| coordinator.and_then(|c| c.listen_addr.clone()))
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());

        let tls_cert = coordinator.and_then(|c| c.tls_cert.clone());
        let tls_key = coordinator.and_then(|c| c.tls_key.clone());
        let client_ca = coordinator.and_then(|c| c.client_ca.clone());

        Ok(Self {
            db_config,
            coordinator_addr,
            listen_addr,
            tls_cert,
            tls_key,
            client_ca,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let original = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://testhost:5432/testdb".to_string(),
            },
            coordinator: CoordinatorSection {
                addr: Some("http://10.0.0.1:7800".to_string()),
                ..Default::default()
            },
        };

        let contents = toml::to_string_pretty(&original).unwrap();
        let loaded: ConfigFile = toml::from_str(&contents).unwrap();

        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.coordinator.addr, original.coordinator.addr);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();

        unsafe { std::env::set_var("DAGCTL_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = DagctlConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");

        unsafe { std::env::remove_var("DAGCTL_DATABASE_URL") };
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();

        unsafe { std::env::set_var("DAGCTL_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = DagctlConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://env:5432/envdb");

        unsafe { std::env::remove_var("DAGCTL_DATABASE_URL") };
    }

    #[test]
    fn resolve_defaults_db_url_and_coordinator_addr_when_nothing_set() {
        let _lock = lock_env();

        unsafe { std::env::remove_var("DAGCTL_DATABASE_URL") };
        unsafe { std::env::remove_var("DAGCTL_COORDINATOR_ADDR") };

        let config = DagctlConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);
        assert_eq!(config.coordinator_addr, DEFAULT_COORDINATOR_ADDR);
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("dagctl/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
