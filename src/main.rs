//! Shawarma webhook - Kubernetes mutating admission webhook that injects the
//! Shawarma sidecar when requested by pod annotations

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shawarma_webhook::server::{self, ServerConf};
use shawarma_webhook::webhook::{webhook_router, Mutator, MutatorConfig};

/// Kubernetes Mutating Admission Webhook to add the Shawarma sidecar when
/// requested by annotations
#[derive(Parser, Debug)]
#[command(name = "shawarma-webhook", version, about, long_about = None)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Set the listening port number
    #[arg(short, long, env = "WEBHOOK_PORT", default_value_t = 8443)]
    port: u16,

    /// File containing the TLS certificate (PEM encoded)
    #[arg(long, env = "CERT_FILE", default_value = "./certs/tls.crt")]
    cert_file: PathBuf,

    /// File containing the TLS private key (PEM encoded)
    #[arg(long, env = "KEY_FILE", default_value = "./certs/tls.key")]
    key_file: PathBuf,

    /// File containing the sidecar configuration
    #[arg(short, long, default_value = "./sidecar.yaml")]
    config: PathBuf,

    /// Default Docker image
    #[arg(
        long,
        env = "SHAWARMA_IMAGE",
        default_value = "centeredge/shawarma:2.0.0-beta001"
    )]
    shawarma_image: String,

    /// Name of the service account which should be used for sidecars
    /// (requires a legacy token secret linked to the service account)
    #[arg(long, env = "SHAWARMA_SERVICE_ACCT_NAME")]
    shawarma_service_acct_name: Option<String>,

    /// Name of the secret containing the Kubernetes token for Shawarma,
    /// overrides shawarma-service-acct-name
    #[arg(long, env = "SHAWARMA_SECRET_TOKEN_NAME")]
    shawarma_secret_token_name: Option<String>,

    /// Inject native sidecars (init containers with restartPolicy Always,
    /// requires Kubernetes 1.29 or later)
    #[arg(long, env = "NATIVE_SIDECARS")]
    native_sidecars: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The TLS stack needs a process-wide crypto provider before any
    // certificate is loaded.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {e:?}");
        std::process::exit(1);
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .map_err(|e| anyhow::anyhow!("invalid log level '{}': {}", cli.log_level, e))?;
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // The Kubernetes client is only needed for service-account monitoring;
    // a failure here disables that path but does not stop the webhook.
    let service_acct_name = cli.shawarma_service_acct_name.filter(|name| !name.is_empty());
    let kube_client = if service_acct_name.is_some() {
        match Client::try_default().await {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(error = %e, "failed to configure kubernetes client, service account monitoring disabled");
                None
            }
        }
    } else {
        None
    };

    let mutator = Arc::new(
        Mutator::new(MutatorConfig {
            sidecar_config_file: cli.config,
            shawarma_image: cli.shawarma_image,
            native_sidecars: cli.native_sidecars,
            shawarma_service_acct_name: service_acct_name,
            shawarma_secret_token_name: cli.shawarma_secret_token_name,
            kube_client,
        })
        .await?,
    );

    let router = webhook_router(Arc::clone(&mutator));
    let conf = ServerConf {
        port: cli.port,
        cert_file: cli.cert_file,
        key_file: cli.key_file,
    };

    server::run_until_shutdown(&conf, router).await?;

    info!("shutting down");
    mutator.shutdown().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_match_the_deployment_manifests() {
        let cli = Cli::try_parse_from(["shawarma-webhook"]).unwrap();
        assert_eq!(cli.log_level, "warn");
        assert_eq!(cli.port, 8443);
        assert_eq!(cli.cert_file, PathBuf::from("./certs/tls.crt"));
        assert_eq!(cli.key_file, PathBuf::from("./certs/tls.key"));
        assert_eq!(cli.config, PathBuf::from("./sidecar.yaml"));
        assert_eq!(cli.shawarma_image, "centeredge/shawarma:2.0.0-beta001");
        assert!(cli.shawarma_service_acct_name.is_none());
        assert!(cli.shawarma_secret_token_name.is_none());
        assert!(!cli.native_sidecars);
    }

    #[test]
    fn cli_accepts_overrides() {
        let cli = Cli::try_parse_from([
            "shawarma-webhook",
            "--port",
            "9443",
            "--config",
            "/etc/shawarma/sidecar.yaml",
            "--shawarma-secret-token-name",
            "shawarma-token",
            "--native-sidecars",
        ])
        .unwrap();
        assert_eq!(cli.port, 9443);
        assert_eq!(cli.config, PathBuf::from("/etc/shawarma/sidecar.yaml"));
        assert_eq!(cli.shawarma_secret_token_name.as_deref(), Some("shawarma-token"));
        assert!(cli.native_sidecars);
    }
}
