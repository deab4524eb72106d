//! TLS HTTP listener with certificate hot reload
//!
//! The certificate and key files are typically projected from a Kubernetes
//! Secret and rotated on disk; the listener reloads them on change and keeps
//! serving the previous pair when a reload fails. Shutdown is triggered by
//! SIGINT or SIGTERM and drains in-flight requests before returning.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::filewatcher::FileWatcher;

/// How long draining connections may take after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Listener configuration
pub struct ServerConf {
    /// Listening port, bound on all interfaces
    pub port: u16,
    /// Path of the PEM-encoded TLS certificate
    pub cert_file: PathBuf,
    /// Path of the PEM-encoded TLS private key
    pub key_file: PathBuf,
}

/// Serve `router` over TLS until a termination signal arrives
///
/// Fails fast when the initial certificate load or the port bind fails;
/// after startup, certificate problems only surface in the log.
pub async fn run_until_shutdown(conf: &ServerConf, router: Router) -> Result<()> {
    let tls_config = RustlsConfig::from_pem_file(&conf.cert_file, &conf.key_file)
        .await
        .map_err(|e| Error::server(format!("failed to load certificate and key: {e}")))?;
    info!("certificate and key loaded");

    let cert_watcher = spawn_reload_watcher(&conf.cert_file, conf, tls_config.clone());
    let key_watcher = spawn_reload_watcher(&conf.key_file, conf, tls_config.clone());

    let handle = Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutting down initiated");
        shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], conf.port));
    info!(port = conf.port, "server starting to listen");

    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await
        .map_err(|e| Error::server(e.to_string()))?;

    cert_watcher.close();
    key_watcher.close();
    Ok(())
}

/// Reload the certificate pair whenever `path` changes
///
/// A failed reload leaves the previously loaded pair in place, so a
/// half-rotated Secret never takes the listener down.
fn spawn_reload_watcher(path: &PathBuf, conf: &ServerConf, tls_config: RustlsConfig) -> FileWatcher {
    let cert_file = conf.cert_file.clone();
    let key_file = conf.key_file.clone();

    FileWatcher::spawn(path, move || {
        let tls_config = tls_config.clone();
        let cert_file = cert_file.clone();
        let key_file = key_file.clone();
        async move {
            match tls_config.reload_from_pem_file(&cert_file, &key_file).await {
                Ok(()) => info!("certificate and key reloaded"),
                Err(e) => error!(error = %e, "error reloading certificate and key"),
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
