use std::{fmt, fs, path::PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Parser;
use directories::ProjectDirs;
use serde::Deserialize;
use url::Url;

/// Command line options for the server.
#[derive(Parser, Debug, Default)]
#[command(name = "parley", about = "Chat backend server")]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Directory for the database and uploaded blobs.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

/// A value that never shows up in logs or `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret<T>(T);

impl<T> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// LiveKit deployment used for voice rooms.
#[derive(Clone, Debug)]
pub struct VoiceConfig {
    pub url: String,
    pub api_key: String,
    pub api_secret: Secret<String>,
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Externally reachable origin, used to build upload and download URLs.
    pub public_url: Url,
    /// Base directory for the database and blob store.
    pub data_dir: PathBuf,
    /// Maximum upload size in megabytes.
    pub max_upload_mb: u64,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    /// HS256 key shared with the identity provider. Generated per process when unset.
    pub jwt_secret: Option<Secret<Vec<u8>>>,
    /// Shared secret identity webhooks must present.
    pub webhook_secret: Option<Secret<String>>,
    pub voice: Option<VoiceConfig>,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    auth: FileAuth,
    #[serde(default)]
    storage: FileStorage,
    #[serde(default)]
    voice: Option<FileVoice>,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    public_url: Option<String>,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileAuth {
    jwt_secret: Option<String>,
    webhook_secret: Option<String>,
}

#[derive(Deserialize, Default)]
struct FileStorage {
    max_upload_mb: Option<u64>,
}

#[derive(Deserialize)]
struct FileVoice {
    url: String,
    api_key: String,
    api_secret: String,
}

fn default_port() -> u16 {
    8787
}

fn default_logging() -> bool {
    true
}

fn default_max_upload_mb() -> u64 {
    10
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
            public_url: None,
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

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("PARLEY_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/parley.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str(&contents).context("invalid config file")?
            }
            Err(_) => FileConfig::default(),
        };
        let mut port = file_cfg.server.port;
        let mut logging = file_cfg.logging.enabled;
        let mut jwt_secret = file_cfg.auth.jwt_secret;
        let mut webhook_secret = file_cfg.auth.webhook_secret;
        let mut max_upload_mb = file_cfg
            .storage
            .max_upload_mb
            .unwrap_or_else(default_max_upload_mb);

        // environment overrides
        if let Ok(p) = std::env::var("PARLEY_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("PARLEY_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        if let Ok(s) = std::env::var("PARLEY_JWT_SECRET") {
            jwt_secret = Some(s);
        }
        if let Ok(s) = std::env::var("PARLEY_WEBHOOK_SECRET") {
            webhook_secret = Some(s);
        }
        if let Some(mb) = std::env::var("MAX_UPLOAD_MB")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            max_upload_mb = mb;
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        // validate port range
        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }

        // bind address precedence for host override
        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let public_url = match file_cfg.server.public_url {
            Some(u) => Url::parse(&u).context("invalid server.public_url")?,
            None => Url::parse(&format!("http://{bind}/")).context("invalid bind address")?,
        };

        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| std::env::var("DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(default_data_dir);

        let jwt_secret = jwt_secret
            .map(|s| STANDARD.decode(s.trim()).context("auth.jwt_secret must be base64"))
            .transpose()?
            .map(Secret::new);

        Ok(Self {
            bind,
            public_url,
            data_dir,
            max_upload_mb,
            logging_enabled: logging,
            jwt_secret,
            webhook_secret: webhook_secret.map(Secret::new),
            voice: file_cfg.voice.map(|v| VoiceConfig {
                url: v.url,
                api_key: v.api_key,
                api_secret: Secret::new(v.api_secret),
            }),
        })
    }

    /// Helper to return the upload limit in bytes.
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }

    /// Configuration for tests and embedding: everything under `data_dir`,
    /// no secrets, voice disabled.
    pub fn for_data_dir(bind: &str, data_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            bind: bind.to_string(),
            public_url: Url::parse(&format!("http://{bind}/"))?,
            data_dir,
            max_upload_mb: default_max_upload_mb(),
            logging_enabled: false,
            jwt_secret: None,
            webhook_secret: None,
            voice: None,
        })
    }
}

/// Determine the default data directory for the server.
pub fn default_data_dir() -> PathBuf {
    match ProjectDirs::from("org", "parley", "parley") {
        Some(dirs) => dirs.data_dir().to_path_buf(),
        None => PathBuf::from("./parley_data"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    const VARS: [&str; 8] = [
        "PARLEY_CONFIG",
        "PARLEY_PORT",
        "PARLEY_LOGGING",
        "PARLEY_JWT_SECRET",
        "PARLEY_WEBHOOK_SECRET",
        "BIND",
        "DATA_DIR",
        "MAX_UPLOAD_MB",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    fn load_with(contents: &str, cli: Cli) -> Result<Config> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, contents).unwrap();
        Config::load(&Cli {
            config: Some(path),
            ..cli
        })
    }

    #[test]
    #[serial]
    fn valid_config_parses() {
        clear_env();
        let cfg = load_with(
            "[server]\nport=5555\npublic_url=\"https://chat.example.org/\"\n\
             [logging]\nenabled=false\n[storage]\nmax_upload_mb=3\n",
            Cli::default(),
        )
        .unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:5555");
        assert_eq!(cfg.public_url.as_str(), "https://chat.example.org/");
        assert!(!cfg.logging_enabled);
        assert_eq!(cfg.max_upload_bytes(), 3 * 1024 * 1024);
    }

    #[test]
    #[serial]
    fn invalid_port_fails() {
        clear_env();
        assert!(load_with("[server]\nport=80\n", Cli::default()).is_err());
    }

    #[test]
    #[serial]
    fn missing_keys_defaults() {
        clear_env();
        let cfg = load_with("", Cli::default()).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:8787");
        assert_eq!(cfg.public_url.as_str(), "http://127.0.0.1:8787/");
        assert!(cfg.logging_enabled);
        assert!(cfg.jwt_secret.is_none());
        assert!(cfg.voice.is_none());
        assert_eq!(cfg.max_upload_mb, 10);
    }

    #[test]
    #[serial]
    fn precedence_cli_env_file() {
        clear_env();
        std::env::set_var("PARLEY_PORT", "2222");
        let cfg = load_with(
            "[server]\nport=1111\n",
            Cli {
                port: Some(3333),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:3333");
        let cfg = load_with("[server]\nport=1111\n", Cli::default()).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:2222");
        clear_env();
    }

    #[test]
    #[serial]
    fn secrets_decode_and_stay_redacted() {
        clear_env();
        std::env::set_var("PARLEY_WEBHOOK_SECRET", "hook");
        let cfg = load_with(
            "[auth]\njwt_secret=\"c2VjcmV0\"\n\
             [voice]\nurl=\"wss://voice.example.org\"\napi_key=\"key\"\napi_secret=\"shh\"\n",
            Cli::default(),
        )
        .unwrap();
        assert_eq!(cfg.jwt_secret.as_ref().unwrap().expose(), b"secret");
        assert_eq!(cfg.webhook_secret.as_ref().unwrap().expose(), "hook");
        let printed = format!("{cfg:?}");
        assert!(!printed.contains("shh"));
        assert!(!printed.contains("hook"));
        assert!(printed.contains("<redacted>"));
        clear_env();
    }

    #[test]
    #[serial]
    fn bad_jwt_secret_is_rejected() {
        clear_env();
        std::env::set_var("PARLEY_JWT_SECRET", "not base64!");
        assert!(load_with("", Cli::default()).is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn logging_toggle() {
        clear_env();
        let cfg = load_with("[logging]\nenabled=false\n", Cli::default()).unwrap();
        assert!(!cfg.logging_enabled);
        std::env::set_var("PARLEY_LOGGING", "true");
        let cfg = load_with("[logging]\nenabled=false\n", Cli::default()).unwrap();
        assert!(cfg.logging_enabled);
        clear_env();
    }
}
