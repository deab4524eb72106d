//! Long-lived watches on ServiceAccounts resolving their token secret name
//!
//! Sidecars that mount a legacy service-account token need the name of the
//! secret linked to the account. Each `(namespace, serviceAccountName)` pair
//! gets one monitor holding a field-selected watch; the first admission to
//! need the pair creates the monitor and blocks briefly for its first event.
//! Monitors live until registry shutdown; they are never garbage-collected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use parking_lot::RwLock;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// How long a freshly created monitor may block waiting for its first event
pub const SECRET_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Observes one service account and keeps its token secret name current
#[derive(Debug)]
pub struct ServiceAcctMonitor {
    /// Namespace of the watched service account
    pub namespace: String,
    /// Name of the watched service account
    pub service_account_name: String,
    secret_name: RwLock<String>,
    has_first_update: AtomicBool,
    first_update: Notify,
    stop: CancellationToken,
}

impl ServiceAcctMonitor {
    fn new(namespace: impl Into<String>, service_account_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            namespace: namespace.into(),
            service_account_name: service_account_name.into(),
            secret_name: RwLock::new(String::new()),
            has_first_update: AtomicBool::new(false),
            first_update: Notify::new(),
            stop: CancellationToken::new(),
        })
    }

    /// The currently observed secret name, empty when none is known
    pub fn secret_name(&self) -> String {
        self.secret_name.read().clone()
    }

    /// Record a newly observed secret name and fire the one-shot first-update
    /// signal. The name is written before the flag so a reader that observed
    /// the signal also sees the name.
    fn update_secret_name(&self, secret_name: String) {
        *self.secret_name.write() = secret_name;

        if !self.has_first_update.swap(true, Ordering::AcqRel) {
            self.first_update.notify_one();
        }
    }

    /// Block until the first add/update/delete event has been processed
    ///
    /// Returns `true` once the first event arrived, `false` on timeout.
    /// Calls after the first event return `true` immediately.
    pub async fn wait_for_first_update(&self, timeout: Duration) -> bool {
        if self.has_first_update.load(Ordering::Acquire) {
            return true;
        }

        info!(
            namespace = %self.namespace,
            service_account = %self.service_account_name,
            "waiting for first update for service account"
        );

        match tokio::time::timeout(timeout, self.first_update.notified()).await {
            Ok(()) => {
                debug!(
                    namespace = %self.namespace,
                    service_account = %self.service_account_name,
                    "got first update for service account"
                );
                true
            }
            Err(_) => {
                warn!(
                    namespace = %self.namespace,
                    service_account = %self.service_account_name,
                    "timeout waiting for first update for service account"
                );
                false
            }
        }
    }

    /// Start the watch task for this monitor
    ///
    /// Watch errors are logged and retried with backoff; they are never
    /// surfaced to admission requests. The task runs until [`Self::stop`].
    fn start(self: &Arc<Self>, client: Client) {
        let monitor = Arc::clone(self);
        let api: Api<ServiceAccount> = Api::namespaced(client, &self.namespace);
        let config = watcher::Config::default()
            .fields(&format!("metadata.name={}", self.service_account_name));

        tokio::spawn(async move {
            let stream = watcher(api, config).default_backoff();
            tokio::pin!(stream);

            loop {
                tokio::select! {
                    _ = monitor.stop.cancelled() => {
                        debug!(
                            namespace = %monitor.namespace,
                            service_account = %monitor.service_account_name,
                            "service account monitor stopped"
                        );
                        break;
                    }
                    event = stream.next() => match event {
                        Some(Ok(watcher::Event::Apply(account)))
                        | Some(Ok(watcher::Event::InitApply(account))) => {
                            debug!(
                                namespace = %monitor.namespace,
                                service_account = %monitor.service_account_name,
                                "service account changed"
                            );
                            monitor.update_secret_name(extract_secret_name(&account));
                        }
                        Some(Ok(watcher::Event::Delete(_))) => {
                            debug!(
                                namespace = %monitor.namespace,
                                service_account = %monitor.service_account_name,
                                "service account deleted"
                            );
                            monitor.update_secret_name(String::new());
                        }
                        Some(Ok(watcher::Event::Init)) | Some(Ok(watcher::Event::InitDone)) => {}
                        Some(Err(e)) => {
                            warn!(
                                namespace = %monitor.namespace,
                                service_account = %monitor.service_account_name,
                                error = %e,
                                "service account watch error"
                            );
                        }
                        None => break,
                    }
                }
            }
        });
    }

    /// Stop the watch task
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

/// First non-empty secret name linked to the service account
fn extract_secret_name(account: &ServiceAccount) -> String {
    account
        .secrets
        .iter()
        .flatten()
        .find_map(|secret| secret.name.clone().filter(|name| !name.is_empty()))
        .unwrap_or_default()
}

/// Registry of service-account monitors, created lazily on first use
pub struct ServiceAcctMonitorSet {
    client: Client,
    monitors: Mutex<Vec<Arc<ServiceAcctMonitor>>>,
}

impl std::fmt::Debug for ServiceAcctMonitorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAcctMonitorSet")
            .field("monitors", &self.monitors)
            .finish()
    }
}

impl ServiceAcctMonitorSet {
    /// Create an empty registry backed by the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            monitors: Mutex::new(Vec::new()),
        }
    }

    /// Return the monitor for the pair, creating and starting it if missing
    ///
    /// A newly created monitor waits up to `timeout` for its first event
    /// before it is registered and returned; on timeout it is returned
    /// anyway with an empty secret name. The mutex is held for the whole
    /// lookup-create-wait sequence so a pair is only ever created once.
    pub async fn get(
        &self,
        namespace: &str,
        service_account_name: &str,
        timeout: Duration,
    ) -> Result<Arc<ServiceAcctMonitor>> {
        let mut monitors = self.monitors.lock().await;

        if let Some(monitor) = monitors
            .iter()
            .find(|m| m.namespace == namespace && m.service_account_name == service_account_name)
        {
            return Ok(Arc::clone(monitor));
        }

        let monitor = ServiceAcctMonitor::new(namespace, service_account_name);
        monitor.start(self.client.clone());
        monitor.wait_for_first_update(timeout).await;

        monitors.push(Arc::clone(&monitor));
        Ok(monitor)
    }

    /// Stop every monitor and clear the registry
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.lock().await;
        for monitor in monitors.iter() {
            monitor.stop();
        }
        monitors.clear();
    }
}
