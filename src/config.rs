use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Gateway configuration.  Every key is optional; the defaults reproduce a
/// local development server on `localhost:2222` serving `./repositories`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Socket address for the SSH listener (e.g. `0.0.0.0:2222`).
    pub listen: String,
    /// Path to the SSH host private key (OpenSSH or PEM encoded).
    pub host_key_path: PathBuf,
    /// Generate an ephemeral Ed25519 host key when `host_key_path` is absent
    /// instead of refusing to start.
    pub generate_host_key: bool,
    /// Directory holding the served repositories.  Created on startup.
    pub repository_root: PathBuf,
    /// Seconds a client may take to finish key exchange and authentication.
    pub handshake_timeout_secs: u64,
    /// Seconds of silence after which russh drops an idle connection.
    pub inactivity_timeout_secs: u64,
    /// Optional socket address for the `/metrics` and `/healthz` endpoints.
    pub metrics_listen: Option<String>,
    pub dispatch: DispatchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:2222".to_string(),
            host_key_path: PathBuf::from("./id_rsa"),
            generate_host_key: false,
            repository_root: PathBuf::from("./repositories"),
            handshake_timeout_secs: 30,
            inactivity_timeout_secs: 600,
            metrics_listen: None,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("invalid SSH listen address: {:?}", self.listen))
    }

    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>> {
        self.metrics_listen
            .as_deref()
            .map(|addr| {
                addr.parse()
                    .with_context(|| format!("invalid metrics listen address: {addr:?}"))
            })
            .transpose()
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// How the repository path is handed to the delegate program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgumentStyle {
    /// `git-upload-pack <repo-path>`
    #[default]
    ExplicitPath,
    /// `git-upload-pack .` with the repository as working directory.
    WorkingDirectory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub argument_style: ArgumentStyle,
    /// Send an `exit-status` of zero after a delegate (or a refused shell)
    /// finishes.
    pub send_exit_status: bool,
    /// End the channel after rejecting an unsupported command or repository
    /// instead of waiting for another `exec` request.
    pub close_on_unsupported: bool,
    /// Reject repository identifiers containing path separators or `..`.
    /// When disabled the identifier is joined onto `repository_root` as-is.
    pub strict_repository_ids: bool,
    /// Absolute directory containing the delegate programs.  When unset the
    /// program is looked up by name.
    pub delegate_dir: Option<PathBuf>,
    /// Upper bound on a single delegate run, in seconds.
    pub delegate_timeout_secs: Option<u64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            argument_style: ArgumentStyle::ExplicitPath,
            send_exit_status: true,
            close_on_unsupported: false,
            strict_repository_ids: true,
            delegate_dir: None,
            delegate_timeout_secs: None,
        }
    }
}

impl DispatchConfig {
    pub fn delegate_timeout(&self) -> Option<Duration> {
        self.delegate_timeout_secs.map(Duration::from_secs)
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate YAML configuration text.
pub fn parse_config(contents: &str) -> Result<Config> {
    // An empty document deserializes to `null`, which means "all defaults".
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    config.listen_addr()?;
    config.metrics_addr()?;
    anyhow::ensure!(
        config.handshake_timeout_secs > 0,
        "handshake_timeout_secs must be greater than zero"
    );
    anyhow::ensure!(
        config.dispatch.delegate_timeout_secs != Some(0),
        "delegate_timeout_secs must be greater than zero when set"
    );
    if let Some(dir) = &config.dispatch.delegate_dir {
        anyhow::ensure!(
            dir.is_absolute(),
            "delegate_dir must be an absolute path, got {}",
            dir.display()
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
