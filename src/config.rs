//! Gateway configuration.
//!
//! [`GatewayConfig`] is read from a YAML file with camelCase keys. Every
//! field has a default, so an empty file is a valid configuration.
//! Durations are written in [`humantime`] syntax (`"5m"`, `"250ms"`).
//!
//! ```yaml
//! server:
//!   address: 0.0.0.0:8080
//!   host:
//!     function: function.local
//!     service: service.local
//! client:
//!   http:
//!     maxConnsPerHost: 128
//!     readTimeout: 30s
//!   grpc:
//!     port: 50051
//!     timeout: 1m
//!     maxRetries: 5
//!     retryCodes: [Unavailable, Unauthenticated, ResourceExhausted]
//! native:
//!   mappingFile: /run/edge/services.yml
//! ```
//!
//! The [`RuntimeContext`] (run mode and namespace) is not part of the file;
//! it comes from the environment the gateway was started in.

use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tonic::Code;

/// Environment variable naming the [`RunMode`].
pub const RUN_MODE_ENV: &str = "GATEWAY_RUN_MODE";
/// Environment variable naming the namespace services live in.
pub const NAMESPACE_ENV: &str = "GATEWAY_NAMESPACE";
/// Namespace used when [`NAMESPACE_ENV`] is unset.
pub const DEFAULT_NAMESPACE: &str = "edge";

/// Errors from loading configuration or runtime context.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("reading {}: {}", .0.display(), .1)]
    Read(PathBuf, #[source] std::io::Error),
    /// The configuration file is not valid.
    #[error("parsing {}: {}", .0.display(), .1)]
    Parse(PathBuf, #[source] serde_yaml::Error),
    /// The run mode is not one this gateway knows.
    #[error("unknown run mode {0:?}, expected \"kube\" or \"native\"")]
    UnknownRunMode(String),
}

/// How services are deployed, which decides how they are resolved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Services run under an orchestrator and are reachable by DNS name.
    #[default]
    Kube,
    /// Services are local processes on ports listed in a mapping file.
    Native,
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kube" => Ok(Self::Kube),
            "native" => Ok(Self::Native),
            other => Err(ConfigError::UnknownRunMode(other.to_owned())),
        }
    }
}

/// Facts about the deployment the gateway runs in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeContext {
    /// Deployment mode.
    pub run_mode: RunMode,
    /// Namespace that orchestrated service names are qualified with.
    pub namespace: String,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Kube,
            namespace: DEFAULT_NAMESPACE.to_owned(),
        }
    }
}

impl RuntimeContext {
    /// Read the context from [`RUN_MODE_ENV`] and [`NAMESPACE_ENV`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Read the context through an arbitrary variable lookup. An unset run
    /// mode means [`RunMode::Kube`]; a set but unrecognised one is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let run_mode = match lookup(RUN_MODE_ENV) {
            Some(m) if !m.is_empty() => m.parse()?,
            _ => RunMode::default(),
        };
        let namespace = lookup(NAMESPACE_ENV)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_owned());
        Ok(Self {
            run_mode,
            namespace,
        })
    }
}

fn duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let s = String::deserialize(d)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Parse a gRPC status code name. Both `Unavailable` and `UNAVAILABLE`
/// (with or without underscores) are accepted.
pub fn parse_code(name: &str) -> Option<Code> {
    let normalized = name.replace('_', "").to_ascii_lowercase();
    Some(match normalized.as_str() {
        "ok" => Code::Ok,
        "cancelled" | "canceled" => Code::Cancelled,
        "unknown" => Code::Unknown,
        "invalidargument" => Code::InvalidArgument,
        "deadlineexceeded" => Code::DeadlineExceeded,
        "notfound" => Code::NotFound,
        "alreadyexists" => Code::AlreadyExists,
        "permissiondenied" => Code::PermissionDenied,
        "resourceexhausted" => Code::ResourceExhausted,
        "failedprecondition" => Code::FailedPrecondition,
        "aborted" => Code::Aborted,
        "outofrange" => Code::OutOfRange,
        "unimplemented" => Code::Unimplemented,
        "internal" => Code::Internal,
        "unavailable" => Code::Unavailable,
        "dataloss" => Code::DataLoss,
        "unauthenticated" => Code::Unauthenticated,
        _ => return None,
    })
}

fn codes<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Code>, D::Error> {
    Vec::<String>::deserialize(d)?
        .iter()
        .map(|name| {
            parse_code(name).ok_or_else(|| {
                serde::de::Error::custom(format!("unknown gRPC status code {:?}", name))
            })
        })
        .collect()
}

/// Top-level gateway configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Inbound listener.
    pub server: ServerConfig,
    /// Outbound clients.
    pub client: ClientConfig,
    /// Native mode settings.
    pub native: NativeConfig,
}

impl GatewayConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
        Self::parse(&data).map_err(|e| ConfigError::Parse(path.to_owned(), e))
    }

    /// Parse configuration from YAML text.
    pub fn parse(data: &str) -> Result<Self, serde_yaml::Error> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(data)
    }
}

/// Inbound listener configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Socket address to listen on.
    ///
    /// Default: `0.0.0.0:8080`
    pub address: String,
    /// Host names used to tell function requests from service requests.
    pub host: HostConfig,
    /// Serve TLS instead of plaintext.
    ///
    /// Default: None
    pub tls: Option<ServerTlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8080".to_owned(),
            host: HostConfig::default(),
            tls: None,
        }
    }
}

/// Host names for host-discriminated routing.
///
/// When neither is set, one- and two-segment paths are always function
/// calls. When at least one is set, such paths are routed by matching the
/// `Host` header against them and rejected if it matches neither.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostConfig {
    /// Host name for function calls.
    pub function: Option<String>,
    /// Host name for proxied service calls.
    pub service: Option<String>,
}

impl HostConfig {
    /// Whether routing should look at the `Host` header at all.
    pub fn discriminates(&self) -> bool {
        self.function.is_some() || self.service.is_some()
    }
}

/// Certificate material for the inbound listener.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTlsConfig {
    /// PEM certificate chain.
    pub cert: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
    /// PEM CA bundle. When set, clients must present a certificate signed
    /// by it.
    #[serde(default)]
    pub ca: Option<PathBuf>,
}

/// Outbound client configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Proxy client for services.
    pub http: HttpClientConfig,
    /// gRPC client for functions.
    pub grpc: GrpcClientConfig,
}

/// Limits for the shared service proxy client.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpClientConfig {
    /// Maximum number of concurrent requests to one host. Further requests
    /// wait for a slot, at most for `read_timeout`.
    ///
    /// Default: 512
    pub max_conns_per_host: usize,

    /// Deadline for receiving a complete response.
    ///
    /// Default: 5m
    #[serde(deserialize_with = "duration")]
    pub read_timeout: Duration,

    /// How long an idle pooled connection is kept.
    ///
    /// Default: 90s
    #[serde(deserialize_with = "duration")]
    pub idle_timeout: Duration,

    /// Deadline for establishing a connection.
    ///
    /// Default: 30s
    #[serde(deserialize_with = "duration")]
    pub connect_timeout: Duration,

    /// Connections older than this are not reused for new requests.
    ///
    /// Default: 5m
    #[serde(deserialize_with = "duration")]
    pub max_conn_duration: Duration,

    /// How many times an idempotent request is attempted when the
    /// connection fails underneath it.
    ///
    /// Default: 3
    #[serde(alias = "maxIdemponentCallAttempts")]
    pub max_idempotent_call_attempts: usize,

    /// Port services are proxied to.
    ///
    /// Default: None (80)
    pub service_port: Option<u16>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            max_conns_per_host: 512,
            read_timeout: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(30),
            max_conn_duration: Duration::from_secs(300),
            max_idempotent_call_attempts: 3,
            service_port: None,
        }
    }
}

/// Settings for function calls.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GrpcClientConfig {
    /// Port dialed when the resolved address carries none.
    ///
    /// Default: 80
    pub port: u16,

    /// Deadline for each call attempt. Every retry gets a fresh one.
    ///
    /// Default: 5m
    #[serde(deserialize_with = "duration")]
    pub timeout: Duration,

    /// Deadline for establishing a connection.
    ///
    /// Default: 30s
    #[serde(deserialize_with = "duration")]
    pub connect_timeout: Duration,

    /// How many times a call is retried after a retryable failure.
    ///
    /// Default: 3
    pub max_retries: u32,

    /// Status codes that mean the back end or the connection to it is
    /// unusable and the call should be retried on a fresh connection.
    ///
    /// Default: `[Unavailable, Unauthenticated]`
    #[serde(deserialize_with = "codes")]
    pub retry_codes: Vec<Code>,

    /// Initial wait between attempts. It grows exponentially.
    ///
    /// Default: 100ms
    #[serde(deserialize_with = "duration")]
    pub retry_interval: Duration,

    /// Use TLS towards function back ends.
    ///
    /// Default: None
    pub tls: Option<ClientTlsConfig>,
}

impl Default for GrpcClientConfig {
    fn default() -> Self {
        Self {
            port: 80,
            timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_codes: vec![Code::Unavailable, Code::Unauthenticated],
            retry_interval: Duration::from_millis(100),
            tls: None,
        }
    }
}

/// Certificate material for outbound gRPC.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTlsConfig {
    /// PEM CA bundle used to verify back ends.
    pub ca: PathBuf,
    /// PEM client certificate chain, for mutual TLS.
    #[serde(default)]
    pub cert: Option<PathBuf>,
    /// PEM client private key, for mutual TLS.
    #[serde(default)]
    pub key: Option<PathBuf>,
    /// Name to verify back end certificates against instead of the host.
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Native mode settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NativeConfig {
    /// Location of the port mapping file.
    ///
    /// Default: `var/lib/edge/run/services.yml`
    pub mapping_file: PathBuf,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            mapping_file: PathBuf::from("var/lib/edge/run/services.yml"),
        }
    }
}
