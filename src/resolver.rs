//! Service name resolution.
//!
//! A [`Resolver`] turns the logical service name from a request path into
//! the address the gateway should dial:
//!
//! - [`OrchestratorResolver`] composes `<service>.<namespace>` and leaves
//!   the rest to cluster DNS. No port is added; the dialer applies the
//!   configured default.
//! - [`NativeResolver`] looks the service up in a watched
//!   [`ServiceMapping`] and returns `127.0.0.1:<port>`, rotating over the
//!   ports listed for it.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::config::RunMode;
use crate::mapping::{MappingError, ServiceMapping};

/// Error returned by [`Resolver::resolve`].
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Empty service names never resolve.
    #[error("empty service name")]
    EmptyName,
    /// The native mapping has no usable entry for the service.
    #[error("{0}")]
    Mapping(#[from] MappingError),
}

/// Error returned when constructing a [`Resolver`].
#[derive(Debug, Error)]
pub enum ResolverError {
    /// The mapping file could not be loaded or watched.
    #[error("native resolver: {0}")]
    Mapping(#[from] MappingError),
}

/// Resolves `<service>` to `<service>.<namespace>`.
#[derive(Clone, Debug)]
pub struct OrchestratorResolver {
    namespace: String,
}

impl OrchestratorResolver {
    /// Create a resolver for services in `namespace`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    fn resolve(&self, service: &str) -> String {
        format!("{}.{}", service, self.namespace)
    }
}

/// Resolves services to loopback ports read from a mapping file.
#[derive(Debug)]
pub struct NativeResolver {
    mapping: Arc<ServiceMapping>,
}

impl NativeResolver {
    /// Load the mapping file at `path` and start watching it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ResolverError> {
        let mapping = ServiceMapping::new(path)?;
        mapping.watch_file()?;
        Ok(Self { mapping })
    }

    /// Use an already loaded mapping. The caller decides whether it is
    /// watched.
    pub fn from_mapping(mapping: Arc<ServiceMapping>) -> Self {
        Self { mapping }
    }

    /// The mapping this resolver reads from.
    pub fn mapping(&self) -> &Arc<ServiceMapping> {
        &self.mapping
    }

    fn resolve(&self, service: &str) -> Result<String, MappingError> {
        let port = self.mapping.get_service_next_port(service)?;
        Ok(format!("127.0.0.1:{}", port))
    }
}

/// Address resolution strategy, chosen once at startup by [`RunMode`].
#[derive(Debug)]
pub enum Resolver {
    /// Orchestrated deployments.
    Orchestrator(OrchestratorResolver),
    /// Native deployments.
    Native(NativeResolver),
}

impl Resolver {
    /// Build the resolver for `mode`. Native mode loads and watches the
    /// mapping file at `mapping_file`; orchestrator mode uses `namespace`.
    pub fn new(
        mode: RunMode,
        namespace: &str,
        mapping_file: impl Into<PathBuf>,
    ) -> Result<Self, ResolverError> {
        Ok(match mode {
            RunMode::Kube => Self::Orchestrator(OrchestratorResolver::new(namespace)),
            RunMode::Native => Self::Native(NativeResolver::open(mapping_file)?),
        })
    }

    /// Resolve `service` to an address.
    pub fn resolve(&self, service: &str) -> Result<String, ResolveError> {
        if service.is_empty() {
            return Err(ResolveError::EmptyName);
        }
        match self {
            Self::Orchestrator(r) => Ok(r.resolve(service)),
            Self::Native(r) => Ok(r.resolve(service)?),
        }
    }

    /// Release background resources. Never fails; problems are logged.
    pub fn close(&self) {
        match self {
            Self::Orchestrator(_) => (),
            Self::Native(r) => r.mapping.close(),
        }
    }
}
