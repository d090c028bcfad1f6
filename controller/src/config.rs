//! Command-line parsing and configuration file loading.
//!
//! A `clap::Parser` CLI locates a config file, and `serde::Deserialize`
//! structs carry `#[serde(default = "...")]` per-field fallbacks so a
//! missing or partial config file still produces a usable `Config`. The
//! on-disk format is `serde_json5`, since ACL rule arrays and host lists
//! read more naturally as JSON5 than TOML.

use std::fs::read_to_string;
use std::net::SocketAddr;

use clap::Parser;
use serde::Deserialize;

use crate::acl::AclRule;

#[derive(Deserialize, Debug, Clone)]
pub struct Listen {
    /// Plaintext (or TLS-sniffed) listen address.
    #[serde(default = "Listen::bind")]
    pub bind: SocketAddr,

    /// Number of worker tasks draining the job queue. Floored at 5
    /// regardless of what's configured.
    #[serde(default = "Listen::workers")]
    pub workers: usize,
}

impl Listen {
    fn bind() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    fn workers() -> usize {
        8
    }
}

impl Default for Listen {
    fn default() -> Self {
        Self {
            bind: Self::bind(),
            workers: Self::workers(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Tls {
    #[serde(default)]
    pub enabled: bool,
    /// PEM certificate chain path.
    pub cert: Option<String>,
    /// PEM private key path.
    pub key: Option<String>,
    /// PEM CA bundle used to verify client certificates for the ACL's
    /// `cert.cn`/`issuer.cn` fields. Absent ⇒ no client-cert verification.
    pub ca: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Acl {
    /// Explicit opt-out. Defaults to fail-closed rather than silently
    /// bypassing the ACL when TLS is on without a CA.
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub rules: Vec<AclRule>,
}

#[derive(Deserialize, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub listen: Listen,
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub acl: Acl,
    #[serde(default)]
    pub log: Log,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: Listen::default(),
            tls: Tls::default(),
            acl: Acl::default(),
            log: Log::default(),
        }
    }
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Path to a serde_json5 configuration file.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Load command-line parameters; if `--config` points at a file, read
    /// and parse it, otherwise fall back to defaults throughout.
    pub fn load() -> anyhow::Result<Self> {
        let cfg_str = Cli::parse()
            .config
            .map(|path| read_to_string(path))
            .transpose()?
            .unwrap_or_default();

        if cfg_str.trim().is_empty() {
            Ok(Config::default())
        } else {
            Ok(serde_json5::from_str(&cfg_str)?)
        }
    }
}
