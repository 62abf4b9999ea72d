//! The error taxonomy returned by the core reconciliation engine.
//!
//! Every public operation on [`crate::reconciler::Reconciler`] resolves to one of these
//! variants (see spec §7). Internal glue code (file IO, config loading) uses
//! [`anyhow::Result`] with `.context(..)` and is converted into one of these variants at the
//! seam where it crosses back out to a caller.

use std::path::PathBuf;

/// Errors surfaced by the reconciliation engine (C1–C7).
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Missing/contradictory request fields. Returned synchronously; no state mutation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// DNS lookup for the service host failed while in `swarm` mode.
    #[error("upstream unreachable: could not resolve '{host}'")]
    UpstreamUnreachable {
        host: String,
        #[source]
        source: anyhow::Error,
    },

    /// An external template file (literal or registry-expansion) could not be read.
    #[error("template not found at {path}")]
    TemplateNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An external template file was read but could not be rendered.
    #[error("template malformed at {path}: {reason}")]
    TemplateMalformed { path: PathBuf, reason: String },

    /// Assembled-config write or per-service snippet write failed. The prior config is left
    /// in place.
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    /// The data-plane process failed to spawn/reload.
    #[error("reload failed: {message}\ncommand: {command}\nconfig excerpt:\n{config_excerpt}")]
    ReloadFailed {
        message: String,
        command: String,
        config_excerpt: String,
    },

    /// A KV PUT/DELETE failed across every reachable registry endpoint.
    #[error("registry error: {0}")]
    RegistryError(String),

    /// The discoverer sidecar returned a non-200 status or an unreachable error.
    #[error("discoverer error: {0}")]
    DiscovererError(String),

    /// The discoverer sidecar returned a body that could not be JSON-decoded.
    #[error("decode error: {0}")]
    DecodeError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
