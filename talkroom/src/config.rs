use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

use crate::backend::{Backend, HttpBackend, MemoryBackend};
use crate::cli::Cli;

/// Connection settings for the hosted backend.
#[derive(Clone, Default)]
pub struct BackendConfig {
    /// Project URL. Without one an in-memory backend is used.
    pub url: Option<Url>,
    pub anon_key: Option<String>,
    /// Privileged key used only by the account deletion endpoint.
    pub service_role_key: Option<String>,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("url", &self.url.as_ref().map(Url::as_str))
            .field("anon_key", &self.anon_key.as_ref().map(|_| "<redacted>"))
            .field(
                "service_role_key",
                &self.service_role_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Room view tuning.
#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub poll_interval: Duration,
    /// Number of most recent messages loaded per refresh.
    pub history_limit: usize,
    /// Maximum rooms a user may belong to; `None` disables the check.
    pub membership_limit: Option<usize>,
    /// Store message text in the reversible encoded form.
    pub obfuscate: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(default_poll_ms()),
            history_limit: default_history_limit(),
            membership_limit: Some(default_membership_limit()),
            obfuscate: false,
        }
    }
}

/// Runtime configuration resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    pub backend: BackendConfig,
    /// Address the first-party endpoints bind to.
    pub bind: String,
    /// Base directory for local state such as the stored session.
    pub data_dir: PathBuf,
    /// Maximum upload size in megabytes.
    pub max_upload_mb: u64,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    pub chat: ChatConfig,
    /// Public origin used when building invite and redirect links.
    pub site_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            bind: format!("127.0.0.1:{}", default_port()),
            data_dir: default_data_dir(),
            max_upload_mb: 5,
            logging_enabled: default_logging(),
            chat: ChatConfig::default(),
            site_url: default_site_url(),
        }
    }
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    backend: FileBackend,
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    chat: FileChat,
    #[serde(default)]
    site: FileSite,
    #[serde(default)]
    logging: FileLogging,
}

#[derive(Deserialize, Default)]
struct FileBackend {
    url: Option<String>,
    anon_key: Option<String>,
    service_role_key: Option<String>,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileChat {
    #[serde(default = "default_poll_ms")]
    poll_interval_ms: u64,
    #[serde(default = "default_history_limit")]
    history_limit: usize,
    #[serde(default = "default_membership_limit")]
    membership_limit: usize,
    #[serde(default)]
    obfuscate: bool,
}

#[derive(Deserialize)]
struct FileSite {
    #[serde(default = "default_site_url")]
    base_url: String,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

fn default_port() -> u16 {
    8787
}

fn default_poll_ms() -> u64 {
    3000
}

fn default_history_limit() -> usize {
    30
}

fn default_membership_limit() -> usize {
    5
}

fn default_site_url() -> String {
    "http://localhost:3000".into()
}

fn default_logging() -> bool {
    true
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileChat {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_ms(),
            history_limit: default_history_limit(),
            membership_limit: default_membership_limit(),
            obfuscate: false,
        }
    }
}

impl Default for FileSite {
    fn default() -> Self {
        Self {
            base_url: default_site_url(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("TALKROOM_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/talkroom.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str::<FileConfig>(&contents).context("invalid config file")?
            }
            Err(_) => FileConfig::default(),
        };

        let mut port = file_cfg.server.port;
        let mut logging = file_cfg.logging.enabled;
        let mut poll_ms = file_cfg.chat.poll_interval_ms;
        let mut backend_url = file_cfg.backend.url;
        let mut anon_key = file_cfg.backend.anon_key;
        let mut service_role_key = file_cfg.backend.service_role_key;
        let mut site_url = file_cfg.site.base_url;

        // environment overrides
        if let Some(p) = env_parse("TALKROOM_PORT") {
            port = p;
        }
        if let Some(l) = env_parse("TALKROOM_LOGGING") {
            logging = l;
        }
        if let Some(ms) = env_parse("TALKROOM_POLL_MS") {
            poll_ms = ms;
        }
        if let Ok(u) = std::env::var("TALKROOM_BACKEND_URL") {
            backend_url = Some(u);
        }
        if let Ok(k) = std::env::var("TALKROOM_ANON_KEY") {
            anon_key = Some(k);
        }
        if let Ok(k) = std::env::var("TALKROOM_SERVICE_ROLE_KEY") {
            service_role_key = Some(k);
        }
        if let Ok(s) = std::env::var("TALKROOM_SITE_URL") {
            site_url = s;
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }
        if let Some(u) = &cli.backend_url {
            backend_url = Some(u.clone());
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }
        if !(500..=3000).contains(&poll_ms) {
            anyhow::bail!("invalid_poll_interval");
        }
        let history_limit = file_cfg.chat.history_limit;
        if !(1..=200).contains(&history_limit) {
            anyhow::bail!("invalid_history_limit");
        }
        let url = backend_url
            .map(|u| {
                // joins below are relative to the project root
                let u = if u.ends_with('/') { u } else { format!("{u}/") };
                Url::parse(&u).context("invalid backend url")
            })
            .transpose()?;

        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| std::env::var("DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(default_data_dir);
        let max_upload_mb = env_parse("MAX_UPLOAD_MB").unwrap_or(5);

        Ok(Self {
            backend: BackendConfig {
                url,
                anon_key,
                service_role_key,
            },
            bind,
            data_dir,
            max_upload_mb,
            logging_enabled: logging,
            chat: ChatConfig {
                poll_interval: Duration::from_millis(poll_ms),
                history_limit,
                membership_limit: match file_cfg.chat.membership_limit {
                    0 => None,
                    n => Some(n),
                },
                obfuscate: file_cfg.chat.obfuscate,
            },
            site_url: site_url.trim_end_matches('/').to_string(),
        })
    }

    /// Helper to return the upload limit in bytes.
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    /// Construct the backend client this configuration points at.
    pub fn connect(&self) -> Result<Arc<dyn Backend>> {
        match &self.backend.url {
            Some(url) => {
                let anon_key = self
                    .backend
                    .anon_key
                    .clone()
                    .context("backend.anon_key is required with backend.url")?;
                Ok(Arc::new(HttpBackend::new(
                    url.clone(),
                    anon_key,
                    self.backend.service_role_key.clone(),
                )))
            }
            None => {
                tracing::warn!("no backend url configured, using in-memory backend");
                Ok(Arc::new(MemoryBackend::new()))
            }
        }
    }
}

/// Determine the default data directory.
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("org", "talkroom", "talkroom")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./talkroom_data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn upload_limit_saturates() {
        let cfg = Config {
            max_upload_mb: u64::MAX,
            ..Config::default()
        };
        assert_eq!(cfg.max_upload_bytes(), u64::MAX);
        assert_eq!(Config::default().max_upload_bytes(), 5 * 1024 * 1024);
    }

    fn clear_env() {
        for key in [
            "TALKROOM_PORT",
            "TALKROOM_LOGGING",
            "TALKROOM_POLL_MS",
            "TALKROOM_BACKEND_URL",
            "TALKROOM_ANON_KEY",
            "TALKROOM_SERVICE_ROLE_KEY",
            "TALKROOM_SITE_URL",
            "BIND",
        ] {
            std::env::remove_var(key);
        }
    }

    fn cli_with(path: PathBuf, extra: &[&str]) -> Cli {
        let mut args = vec!["talkroom".to_string(), "--config".into(), path.display().to_string()];
        args.extend(extra.iter().map(|s| s.to_string()));
        args.push("whoami".into());
        Cli::parse_from(args)
    }

    #[test]
    #[serial]
    fn valid_config_parses() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(
            &path,
            "[server]\nport=5555\n[logging]\nenabled=false\n[backend]\nurl=\"https://proj.example.co\"\nanon_key=\"anon\"\n[chat]\npoll_interval_ms=500\nmembership_limit=0\n",
        )
        .unwrap();
        let cfg = Config::load(&cli_with(path, &[])).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:5555");
        assert!(!cfg.logging_enabled);
        assert_eq!(
            cfg.backend.url.as_ref().map(Url::as_str),
            Some("https://proj.example.co/")
        );
        assert_eq!(cfg.chat.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.chat.membership_limit, None);
    }

    #[test]
    #[serial]
    fn missing_keys_defaults() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, "").unwrap();
        let cfg = Config::load(&cli_with(path, &[])).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:8787");
        assert!(cfg.logging_enabled);
        assert!(cfg.backend.url.is_none());
        assert_eq!(cfg.chat.history_limit, 30);
        assert_eq!(cfg.chat.membership_limit, Some(5));
        assert_eq!(cfg.chat.poll_interval, Duration::from_millis(3000));
        assert_eq!(cfg.site_url, "http://localhost:3000");
    }

    #[test]
    #[serial]
    fn invalid_values_fail() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, "[server]\nport=80\n").unwrap();
        assert!(Config::load(&cli_with(path.clone(), &[])).is_err());
        fs::write(&path, "[chat]\npoll_interval_ms=100\n").unwrap();
        assert!(Config::load(&cli_with(path, &[])).is_err());
    }

    #[test]
    #[serial]
    fn precedence_cli_env_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, "[server]\nport=1111\n").unwrap();
        std::env::set_var("TALKROOM_PORT", "2222");
        let cfg = Config::load(&cli_with(path.clone(), &[])).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:2222");
        let cfg = Config::load(&cli_with(path, &["--port", "3333"])).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:3333");
        std::env::remove_var("TALKROOM_PORT");
    }

    #[test]
    fn debug_hides_keys() {
        let cfg = BackendConfig {
            url: None,
            anon_key: Some("anon-secret".into()),
            service_role_key: Some("service-secret".into()),
        };
        let out = format!("{:?}", cfg);
        assert!(!out.contains("secret"));
    }
}
