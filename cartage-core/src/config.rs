//! Configuration management for cartage
//!
//! Handles CLI argument parsing, config file loading, and defaults. Values
//! given on the command line override those from `--config`.

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::chunker::DEFAULT_CHUNK_SIZE;
use crate::dag::{check_build_params, DEFAULT_MAX_LINKS};
use crate::layout_cache::LayoutCacheConfig;
use crate::server::ServerConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "cartage")]
#[command(about = "Content-addressed archive transfer node", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Data directory for blocks and tokens
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve archives over HTTP and libp2p
    Serve(ServeCommand),
    /// Import a file into the block store
    Import(ImportCommand),
    /// Issue a transfer token for an imported root
    Authorize(AuthorizeCommand),
    /// Download an archive from a provider
    Fetch(FetchCommand),
}

#[derive(Args, Debug, Clone, Default)]
pub struct ServeCommand {
    /// TCP port for the HTTP binding
    #[arg(long)]
    pub http_port: Option<u16>,

    /// TCP port for libp2p
    #[arg(long)]
    pub p2p_port: Option<u16>,

    /// Seconds an unreferenced layout stays cached
    #[arg(long)]
    pub layout_idle_delay_secs: Option<u64>,

    /// Refuse tokens older than this many seconds
    #[arg(long)]
    pub token_ttl_secs: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct ImportCommand {
    /// File to import
    pub file: PathBuf,

    /// Leaf block size in bytes
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Maximum links per interior node
    #[arg(long)]
    pub max_links: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct AuthorizeCommand {
    /// Root CID of an imported payload
    pub root: String,

    /// Identity the token is issued to
    #[arg(long)]
    pub client: String,

    /// Proposal CID; defaults to the root
    #[arg(long)]
    pub proposal: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct FetchCommand {
    /// http://host:port or libp2p://<multiaddr>/p2p/<peer>
    pub endpoint: String,

    /// Root CID to fetch
    pub root: String,

    /// Identity the token was issued to
    #[arg(long)]
    pub client: String,

    /// Transfer token
    #[arg(long)]
    pub token: String,

    /// Destination file
    #[arg(long, short)]
    pub output: PathBuf,

    /// Expected archive size in bytes
    #[arg(long)]
    pub expected_size: Option<u64>,

    /// Continue a partially downloaded file
    #[arg(long)]
    pub resume: bool,

    /// Ranged retries after an interrupted download
    #[arg(long, default_value_t = crate::client::DEFAULT_MAX_RESUME_ATTEMPTS)]
    pub max_resume_attempts: usize,

    /// Skip block verification of the downloaded archive
    #[arg(long)]
    pub no_verify: bool,
}

/// What the binary was asked to do
#[derive(Debug, Clone)]
pub enum Action {
    Serve,
    Import(ImportCommand),
    Authorize(AuthorizeCommand),
    Fetch(FetchCommand),
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_http_port() -> u16 {
    8080
}

fn default_p2p_port() -> u16 {
    8070
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_layout_idle_delay_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_max_links() -> usize {
    DEFAULT_MAX_LINKS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_layout_idle_delay_secs")]
    pub layout_idle_delay_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default)]
    pub token_ttl_secs: Option<u64>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_links")]
    pub max_links: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: default_data_dir(),
            http_port: default_http_port(),
            p2p_port: default_p2p_port(),
            log_level: default_log_level(),
            layout_idle_delay_secs: default_layout_idle_delay_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            token_ttl_secs: None,
            chunk_size: default_chunk_size(),
            max_links: default_max_links(),
        }
    }
}

impl Config {
    /// Build config and the requested action from CLI arguments
    ///
    /// Exits the process on `--help`, `--version` or a usage error.
    pub fn from_cli() -> Result<(Self, Action), ConfigError> {
        Self::from_parsed(Cli::parse())
    }

    /// Like [`from_cli`](Self::from_cli) with explicit arguments
    pub fn from_args<I, T>(args: I) -> Result<(Self, Action), ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::from_parsed(cli)
    }

    fn from_parsed(cli: Cli) -> Result<(Self, Action), ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_common(&cli.common);

        let action = match cli.command {
            Commands::Serve(cmd) => {
                config.apply_serve(&cmd);
                Action::Serve
            }
            Commands::Import(cmd) => {
                if let Some(chunk_size) = cmd.chunk_size {
                    config.chunk_size = chunk_size;
                }
                if let Some(max_links) = cmd.max_links {
                    config.max_links = max_links;
                }
                Action::Import(cmd)
            }
            Commands::Authorize(cmd) => Action::Authorize(cmd),
            Commands::Fetch(cmd) => Action::Fetch(cmd),
        };

        config.validate()?;
        Ok((config, action))
    }

    /// Load config from a TOML file; missing keys take their defaults
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    fn apply_common(&mut self, args: &CommonArgs) {
        if let Some(data_dir) = &args.data_dir {
            self.data_dir = data_dir.clone();
        }
        if let Some(log_level) = &args.log_level {
            self.log_level = log_level.clone();
        }
    }

    fn apply_serve(&mut self, cmd: &ServeCommand) {
        if let Some(port) = cmd.http_port {
            self.http_port = port;
        }
        if let Some(port) = cmd.p2p_port {
            self.p2p_port = port;
        }
        if let Some(secs) = cmd.layout_idle_delay_secs {
            self.layout_idle_delay_secs = secs;
        }
        if cmd.token_ttl_secs.is_some() {
            self.token_ttl_secs = cmd.token_ttl_secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_build_params(self.chunk_size, self.max_links)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    pub fn auth_dir(&self) -> PathBuf {
        self.data_dir.join("auth")
    }

    pub fn layout_cache_config(&self) -> LayoutCacheConfig {
        LayoutCacheConfig {
            idle_delay: Duration::from_secs(self.layout_idle_delay_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            token_ttl: self.token_ttl_secs.map(Duration::from_secs),
            ..ServerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.p2p_port, 8070);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serve_overrides() {
        let (config, action) = Config::from_args([
            "cartage",
            "--data-dir",
            "./test-data",
            "serve",
            "--http-port",
            "9000",
            "--token-ttl-secs",
            "3600",
        ])
        .unwrap();

        assert!(matches!(action, Action::Serve));
        assert_eq!(config.data_dir, PathBuf::from("./test-data"));
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.p2p_port, 8070);
        assert_eq!(config.server_config().token_ttl, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_fetch_command() {
        let (_, action) = Config::from_args([
            "cartage",
            "fetch",
            "http://127.0.0.1:8080",
            "bafkreigh2akiscaildcqabsyg3dfr6chu3fgpregiymsck7e7aqa4s52zy",
            "--client",
            "me",
            "--token",
            "abc",
            "-o",
            "out.car",
            "--resume",
        ])
        .unwrap();

        match action {
            Action::Fetch(cmd) => {
                assert!(cmd.resume);
                assert!(!cmd.no_verify);
                assert_eq!(cmd.output, PathBuf::from("out.car"));
                assert_eq!(cmd.max_resume_attempts, crate::client::DEFAULT_MAX_RESUME_ATTEMPTS);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_config_file_with_cli_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "http_port = 7000\nlayout_idle_delay_secs = 5\nlog_level = \"debug\"").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let (config, _) = Config::from_args([
            "cartage",
            "--config",
            path.as_str(),
            "--log-level",
            "warn",
            "serve",
        ])
        .unwrap();

        assert_eq!(config.http_port, 7000);
        assert_eq!(config.layout_idle_delay_secs, 5);
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.max_links, DEFAULT_MAX_LINKS);
    }

    #[test]
    fn test_invalid_import_settings() {
        let result = Config::from_args(["cartage", "import", "file.bin", "--max-links", "1"]);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_chunk_size_must_fit_an_archive_section() {
        let too_big = (crate::dag::MAX_CHUNK_SIZE + 1).to_string();
        let result = Config::from_args(["cartage", "import", "x.bin", "--chunk-size", too_big.as_str()]);
        assert!(matches!(result, Err(ConfigError::Invalid(msg)) if msg.contains("chunk_size")));

        let result = Config::from_args(["cartage", "import", "x.bin", "--chunk-size", "40000000"]);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let too_wide = (crate::dag::MAX_LINKS_LIMIT + 1).to_string();
        let result = Config::from_args(["cartage", "import", "x.bin", "--max-links", too_wide.as_str()]);
        assert!(matches!(result, Err(ConfigError::Invalid(msg)) if msg.contains("max_links")));

        let largest = crate::dag::MAX_CHUNK_SIZE.to_string();
        let (config, _) =
            Config::from_args(["cartage", "import", "x.bin", "--chunk-size", largest.as_str()]).unwrap();
        assert_eq!(config.chunk_size, crate::dag::MAX_CHUNK_SIZE);
    }
}
