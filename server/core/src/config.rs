//! The server configuration as processed from the startup wrapper. [`ServerConfig`] is the
//! file format, [`Configuration`] is what the server core is started with.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use gatehouse_proto::constants::DEFAULT_SERVER_ADDRESS;
use gatehoused_lib::constants::{
    DEFAULT_COLLABORATOR_TIMEOUT, DEFAULT_SESSION_RETENTION, PURGE_FREQUENCY,
};
use gatehoused_lib::directory::UserRecord;
use gatehoused_lib::policy::RiskPolicy;
use gatehoused_lib::registry::{FlowDefinition, RegistryConfig};
use gatehoused_lib::source::OAuthSourceConfig;
use gatehoused_lib::stage::StageRef;
use serde::Deserialize;
use sketching::tracing_subscriber::EnvFilter;
use url::Url;

/// An external identity source. Codes listed in `codes` are exchanged for
/// the claims given, which is how development servers stand in for a provider.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub slug: String,
    pub client_id: String,
    pub authorization_url: Url,
    pub redirect_uri: Url,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub codes: BTreeMap<String, BTreeMap<String, String>>,
}

impl SourceConfig {
    pub fn oauth(&self) -> OAuthSourceConfig {
        OAuthSourceConfig {
            slug: self.slug.clone(),
            client_id: self.client_id.clone(),
            authorization_url: self.authorization_url.clone(),
            redirect_uri: self.redirect_uri.clone(),
            scopes: self
                .scopes
                .clone()
                .unwrap_or_else(|| vec!["openid".to_string()]),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct CaptchaToken {
    pub token: String,
    #[serde(default = "default_true")]
    pub success: bool,
    pub score: Option<f64>,
}

fn default_true() -> bool {
    true
}

/// Verdicts for the static captcha verifier.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct CaptchaSettings {
    #[serde(default)]
    pub tokens: Vec<CaptchaToken>,
}

/// This is the Server Configuration as read from `server.toml`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// The user-facing URL for this server, eg <https://idm.example.com>
    pub origin: Url,
    /// The listener address for the HTTP server.
    ///
    /// eg. `[::]:8443` or `127.0.0.1:8443`. Defaults to [gatehouse_proto::constants::DEFAULT_SERVER_ADDRESS]
    pub bindaddress: Option<String>,
    /// The log level, one of info, debug, trace. Defaults to "info" if not set.
    pub log_level: Option<LogLevel>,
    /// Path of the SQLite session database. Sessions are kept in memory if unset.
    pub db_path: Option<String>,

    /// Upper bound on each call to a source or captcha verifier, in seconds.
    pub source_timeout_secs: Option<u64>,
    /// How often expired sessions are swept, in seconds.
    pub sweep_interval_secs: Option<u64>,
    /// How long expired and finished sessions are kept, in seconds.
    pub session_retention_secs: Option<u64>,

    #[serde(default, rename = "stage")]
    pub stages: Vec<StageRef>,
    #[serde(default, rename = "flow")]
    pub flows: Vec<FlowDefinition>,
    #[serde(default, rename = "source")]
    pub sources: Vec<SourceConfig>,
    #[serde(default, rename = "user")]
    pub users: Vec<UserRecord>,
    #[serde(default)]
    pub captcha: CaptchaSettings,
    pub risk_policy: Option<RiskPolicy>,
}

impl ServerConfig {
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, std::io::Error> {
        let mut f = File::open(config_path.as_ref()).map_err(|e| {
            eprintln!(
                "Unable to open config file {:?} [{:?}] 🥺",
                config_path.as_ref(),
                e
            );
            e
        })?;

        let mut contents = String::new();
        f.read_to_string(&mut contents).map_err(|e| {
            eprintln!("unable to read contents {:?}", e);
            e
        })?;

        Self::from_toml(contents.as_str())
    }

    pub fn from_toml(contents: &str) -> Result<Self, std::io::Error> {
        toml::from_str(contents).map_err(|e| {
            eprintln!("unable to parse config {:?}", e);
            std::io::Error::new(std::io::ErrorKind::Other, e)
        })
    }
}

#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    #[default]
    #[serde(rename = "info")]
    Info,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "trace")]
    Trace,
}

impl FromStr for LogLevel {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err("Must be one of info, debug, trace"),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        })
    }
}

impl From<LogLevel> for EnvFilter {
    fn from(value: LogLevel) -> Self {
        EnvFilter::new(value.to_string())
    }
}

/// The internal configuration of the server.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub address: String,
    pub origin: Url,
    pub log_level: LogLevel,
    pub db_path: Option<String>,
    pub source_timeout: Duration,
    pub sweep_interval: Duration,
    pub session_retention: Duration,
    pub registry: RegistryConfig,
    pub sources: Vec<SourceConfig>,
    pub users: Vec<UserRecord>,
    pub captcha: CaptchaSettings,
    pub risk_policy: Option<RiskPolicy>,
}

impl From<ServerConfig> for Configuration {
    fn from(sconfig: ServerConfig) -> Self {
        Configuration {
            address: sconfig
                .bindaddress
                .unwrap_or_else(|| DEFAULT_SERVER_ADDRESS.to_string()),
            origin: sconfig.origin,
            log_level: sconfig.log_level.unwrap_or_default(),
            db_path: sconfig.db_path,
            source_timeout: Duration::from_secs(
                sconfig
                    .source_timeout_secs
                    .unwrap_or(DEFAULT_COLLABORATOR_TIMEOUT),
            ),
            sweep_interval: Duration::from_secs(
                sconfig.sweep_interval_secs.unwrap_or(PURGE_FREQUENCY),
            ),
            session_retention: Duration::from_secs(
                sconfig
                    .session_retention_secs
                    .unwrap_or(DEFAULT_SESSION_RETENTION),
            ),
            registry: RegistryConfig {
                stages: sconfig.stages,
                flows: sconfig.flows,
            },
            sources: sconfig.sources,
            users: sconfig.users,
            captcha: sconfig.captcha,
            risk_policy: sconfig.risk_policy,
        }
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "address: {}, ", self.address)?;
        write!(f, "origin: {}, ", self.origin)?;
        match &self.db_path {
            Some(p) => write!(f, "session db: {}, ", p),
            None => write!(f, "session db: memory, "),
        }?;
        write!(f, "source timeout: {}s, ", self.source_timeout.as_secs())?;
        write!(f, "sweep interval: {}s, ", self.sweep_interval.as_secs())?;
        write!(f, "retention: {}s, ", self.session_retention.as_secs())?;
        write!(f, "stages: {}, ", self.registry.stages.len())?;
        write!(f, "flows: {}, ", self.registry.flows.len())?;
        write!(f, "sources: {}, ", self.sources.len())?;
        write!(f, "users: {}, ", self.users.len())?;
        write!(f, "risk policy: {}, ", self.risk_policy.is_some())?;
        write!(f, "log level: {}", self.log_level)
    }
}
