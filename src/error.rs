//! Error types for the webhook
//!
//! Admission-visible failures carry the exact message text returned to the
//! API server inside the admission response; everything else is surfaced to
//! the operator through logs or process exit.

use thiserror::Error;

/// Convenience alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for webhook operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or incomplete mutator configuration
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of what's missing or invalid
        message: String,
    },

    /// The sidecar configuration file could not be read or parsed
    #[error("failed to load sidecar configuration from {path}: {message}")]
    SidecarConfig {
        /// Path of the configuration file
        path: String,
        /// Description of what failed
        message: String,
    },

    /// One or more requested sidecar templates are absent from the store
    #[error("did not find one or more sidecars to inject {names:?}")]
    MissingSidecars {
        /// The template names that were requested
        names: Vec<String>,
    },

    /// The monitored service account has no usable token secret
    #[error("cannot find secret for service account {namespace}/{service_account}")]
    SecretNotFound {
        /// Namespace of the service account
        namespace: String,
        /// Name of the service account
        service_account: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// JSON serialization error while building a patch
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// HTTP listener error
    #[error("server error: {message}")]
    Server {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a sidecar configuration error for the given file path
    pub fn sidecar_config(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SidecarConfig {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a missing-sidecars error listing the requested template names
    pub fn missing_sidecars(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::MissingSidecars {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a secret-not-found error for a service account
    pub fn secret_not_found(
        namespace: impl Into<String>,
        service_account: impl Into<String>,
    ) -> Self {
        Self::SecretNotFound {
            namespace: namespace.into(),
            service_account: service_account.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a server error with the given message
    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server {
            message: msg.into(),
        }
    }
}
