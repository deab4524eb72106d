//! Kubernetes mutating admission webhook that injects the Shawarma sidecar
//! into pods requesting it through annotations
//!
//! The API server posts `AdmissionReview` payloads over TLS; the webhook
//! answers with a JSON-Patch appending the configured sidecar containers,
//! volumes and image-pull secrets. Sidecar templates are hot-reloaded from a
//! configuration file, and service-account token secrets are resolved
//! through long-lived watches.

#![deny(missing_docs)]

pub mod error;
pub mod filewatcher;
pub mod server;
pub mod webhook;

pub use error::{Error, Result};
