//! Configuration
//!
//! Closed set of recognised keys, loadable from a TOML file, overridden by
//! `UDB_<NAME>` environment variables and finally by CLI flags. Empty
//! strings mean "unset" for the optional keys, mirroring how the deployment
//! tooling writes its config files.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UdbError};

mod validator;

pub use validator::ConfigValidator;

/// Log verbosity of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "udb=error",
            LogLevel::Warn => "udb=warn",
            LogLevel::Info => "udb=info",
            LogLevel::Debug => "udb=debug",
        }
    }
}

/// Application configuration. Keys are kebab-case in files and
/// `UDB_UPPER_SNAKE` in the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub log_file: String,
    pub log_access_file: String,
    pub log_level: LogLevel,
    pub debug: bool,
    /// Drop privileges to this user after binding
    pub user: String,
    pub group: String,
    pub umask: String,
    pub header_name: String,
    pub header_logo: String,
    pub footer_name: String,
    pub footer_url: String,
    pub favicon: String,
    pub welcome_msg: String,
    /// Failed-attempt threshold per tumbling window; 0 disables
    pub rate_limit: u32,
    pub rate_limit_dir: String,
    pub session_dir: String,
    pub db_uri: String,
    pub admin_user: String,
    /// Pre-hashed admin password (argon2 or `{SSHA}`); empty keeps the
    /// built-in default credential
    pub admin_password: String,
    pub ldap_uri: String,
    pub ldap_base_dn: String,
    pub ldap_bind_dn: String,
    pub ldap_bind_password: String,
    pub ldap_username_attribute: String,
    pub ldap_fullname_attribute: Vec<String>,
    pub ldap_email_attribute: String,
    pub ldap_required_group: String,
    pub ldap_admin_group: Vec<String>,
    pub ldap_dnszone_mgmt_group: Vec<String>,
    pub ldap_subnet_mgmt_group: Vec<String>,
    pub ldap_user_group: Vec<String>,
    pub ldap_guest_group: Vec<String>,
    pub smtp_server: String,
    pub smtp_username: String,
    pub smtp_password: String,
    pub smtp_encryption: String,
    pub smtp_from: String,
    pub notification_catch_all_email: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            log_file: String::new(),
            log_access_file: String::new(),
            log_level: LogLevel::Info,
            debug: false,
            user: String::new(),
            group: String::new(),
            umask: String::new(),
            header_name: "UDB".to_string(),
            header_logo: String::new(),
            footer_name: String::new(),
            footer_url: String::new(),
            favicon: String::new(),
            welcome_msg: String::new(),
            rate_limit: 20,
            rate_limit_dir: String::new(),
            session_dir: String::new(),
            db_uri: "data.db".to_string(),
            admin_user: "admin".to_string(),
            admin_password: String::new(),
            ldap_uri: String::new(),
            ldap_base_dn: String::new(),
            ldap_bind_dn: String::new(),
            ldap_bind_password: String::new(),
            ldap_username_attribute: "uid".to_string(),
            ldap_fullname_attribute: vec!["displayName".to_string()],
            ldap_email_attribute: "mail".to_string(),
            ldap_required_group: String::new(),
            ldap_admin_group: Vec::new(),
            ldap_dnszone_mgmt_group: Vec::new(),
            ldap_subnet_mgmt_group: Vec::new(),
            ldap_user_group: Vec::new(),
            ldap_guest_group: Vec::new(),
            smtp_server: String::new(),
            smtp_username: String::new(),
            smtp_password: String::new(),
            smtp_encryption: String::new(),
            smtp_from: String::new(),
            notification_catch_all_email: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from a file, apply environment overrides and
    /// validate.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(UdbError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|e| UdbError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for deployments with no file.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Apply environment variable overrides in the form
    /// `UDB_SERVER_PORT=8080`. Unknown keys are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix("UDB_") {
                if let Err(e) = self.set_value(&name.to_lowercase().replace('_', "-"), &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    /// Set one configuration key from its textual form, keeping the key's
    /// original type. Lists split on commas.
    pub fn set_value(&mut self, key: &str, raw: &str) -> Result<()> {
        let mut table = match toml::Value::try_from(&*self) {
            Ok(toml::Value::Table(table)) => table,
            _ => return Err(UdbError::Config("configuration is not a table".to_string())),
        };
        let current = table
            .get(key)
            .ok_or_else(|| UdbError::Config(format!("unknown configuration key `{key}`")))?;
        let parsed = match current {
            toml::Value::Boolean(_) => toml::Value::Boolean(
                matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
            ),
            toml::Value::Integer(_) => toml::Value::Integer(raw.parse().map_err(|_| {
                UdbError::Config(format!("cannot parse `{raw}` as a number for `{key}`"))
            })?),
            toml::Value::Array(_) => toml::Value::Array(
                raw.split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| toml::Value::String(v.to_string()))
                    .collect(),
            ),
            _ => toml::Value::String(raw.to_string()),
        };
        table.insert(key.to_string(), parsed);
        *self = toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| UdbError::Config(e.to_string()))?;
        Ok(())
    }

    /// Fold CLI flags over the loaded configuration.
    pub fn merge_args(&mut self, args: &Args) {
        if args.debug {
            self.debug = true;
            self.log_level = LogLevel::Debug;
        }
        if let Some(host) = &args.server_host {
            self.server_host = host.clone();
        }
        if let Some(port) = args.server_port {
            self.server_port = port;
        }
        if let Some(log_file) = &args.log_file {
            self.log_file = log_file.clone();
        }
        if let Some(level) = args.log_level {
            self.log_level = level;
        }
        if let Some(db_uri) = &args.db_uri {
            self.db_uri = db_uri.clone();
        }
        if let Some(rate_limit) = args.rate_limit {
            self.rate_limit = rate_limit;
        }
    }

    /// Filesystem path of the SQLite database: either a plain path or a
    /// `sqlite://` URI.
    pub fn db_path(&self) -> PathBuf {
        let raw = self
            .db_uri
            .strip_prefix("sqlite://")
            .unwrap_or(&self.db_uri);
        PathBuf::from(raw)
    }

    /// Default configuration file location.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| UdbError::Config("Cannot determine config directory".to_string()))?;
        Ok(config_dir.join("udb").join("config.toml"))
    }
}

/// CLI flags recognised by the status binary and embedding dispatchers.
#[derive(Parser, Debug, Default)]
#[command(
    name = "udb",
    version,
    about = "IPAM consistency core: network inventory with audit trail, rules and search"
)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'f', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug mode; forces the DEBUG log level
    #[arg(short, long)]
    pub debug: bool,

    /// IP address to listen on
    #[arg(long, value_name = "IP")]
    pub server_host: Option<String>,

    /// Port to listen on
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Location of the log file
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<String>,

    /// Log level
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Location of the database, a file path or sqlite:// URI
    #[arg(long, value_name = "URI")]
    pub db_uri: Option<String>,

    /// Failed-attempt threshold per rate-limit window
    #[arg(long, value_name = "N")]
    pub rate_limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server_host, "127.0.0.1");
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.rate_limit, 20);
        assert_eq!(config.admin_user, "admin");
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn test_set_value_keeps_types() {
        let mut config = Config::default();
        config.set_value("server-port", "9090").unwrap();
        assert_eq!(config.server_port, 9090);

        config.set_value("debug", "true").unwrap();
        assert!(config.debug);

        config.set_value("ldap-admin-group", "net-admins, sysadmins").unwrap();
        assert_eq!(config.ldap_admin_group, vec!["net-admins", "sysadmins"]);

        assert!(config.set_value("server-port", "not-a-port").is_err());
        assert!(config.set_value("no-such-key", "x").is_err());
    }

    #[test]
    fn test_db_path_accepts_uri_and_plain() {
        let mut config = Config::default();
        config.db_uri = "sqlite:///srv/udb/file.db".to_string();
        assert_eq!(config.db_path(), PathBuf::from("/srv/udb/file.db"));
        config.db_uri = "/srv/udb/file.db".to_string();
        assert_eq!(config.db_path(), PathBuf::from("/srv/udb/file.db"));
    }

    #[test]
    fn test_merge_args() {
        let mut config = Config::default();
        let args = Args {
            debug: true,
            server_port: Some(8888),
            db_uri: Some("test.db".to_string()),
            ..Default::default()
        };
        config.merge_args(&args);
        assert!(config.debug);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.server_port, 8888);
        assert_eq!(config.db_uri, "test.db");
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "server-port = 9999\nlog-level = \"DEBUG\"\nrate-limit = 5\nheader-name = \"BFH IPAM\"\n",
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server_port, 9999);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.rate_limit, 5);
        assert_eq!(config.header_name, "BFH IPAM");
    }

    #[test]
    fn test_load_missing_file() {
        match Config::load(Path::new("/nonexistent/config.toml")) {
            Err(UdbError::ConfigNotFound { .. }) => {}
            other => panic!("unexpected result {other:?}"),
        }
    }
}
