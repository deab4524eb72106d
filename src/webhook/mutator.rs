//! Admission review handling and pod mutation
//!
//! Decodes `AdmissionReview` payloads (v1 and v1beta1 share one wire shape),
//! decides whether the pod asked for injection, and synthesizes the
//! JSON-Patch that appends the configured sidecar. The response review is
//! encoded in the same API version the request declared, defaulting to v1.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::{prelude::BASE64_STANDARD, Engine};
use json_patch::{AddOperation, Patch, PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::admission::{AdmissionRequest, AdmissionReview};
use kube::core::TypeMeta;
use kube::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

use super::service_account::{ServiceAcctMonitorSet, SECRET_WAIT_TIMEOUT};
use super::sidecar::SidecarMap;
use super::sidecar_monitor::{SidecarMonitor, SidecarStore};

/// Annotation that triggers injection when it names a service
pub const INJECT_ANNOTATION: &str = "shawarma.centeredge.io/service-name";
/// Annotation that triggers injection when it carries service labels
pub const LABEL_INJECT_ANNOTATION: &str = "shawarma.centeredge.io/service-labels";
/// Annotation overriding the configured sidecar image
pub const IMAGE_ANNOTATION: &str = "shawarma.centeredge.io/image";
/// Annotation recording that the pod has already been injected
pub const STATUS_ANNOTATION: &str = "shawarma.centeredge.io/status";

const INJECTED_VALUE: &str = "injected";
const SIDECAR_NAME: &str = "shawarma";
const SIDECAR_WITH_TOKEN_NAME: &str = "shawarma-withtoken";
const IMAGE_TOKEN: &str = "|SHAWARMA_IMAGE|";
const TOKEN_NAME_TOKEN: &str = "|SHAWARMA_TOKEN_NAME|";

const ADMISSION_V1: &str = "admission.k8s.io/v1";
const REVIEW_KIND: &str = "AdmissionReview";
const JSON_PATCH_TYPE: &str = "JSONPatch";

/// Namespaces whose pods are never mutated
const SYSTEM_NAMESPACES: [&str; 2] = ["kube-system", "kube-public"];

/// Configuration for building a [`Mutator`]
pub struct MutatorConfig {
    /// Path of the sidecar configuration file
    pub sidecar_config_file: PathBuf,
    /// Default sidecar image, substituted for `|SHAWARMA_IMAGE|`
    pub shawarma_image: String,
    /// Inject native sidecars (init containers with restartPolicy Always)
    pub native_sidecars: bool,
    /// Service account whose token secret is mounted into sidecars
    pub shawarma_service_acct_name: Option<String>,
    /// Explicit token secret name, takes precedence over the service account
    pub shawarma_secret_token_name: Option<String>,
    /// Kubernetes client for the service-account monitors; only required when
    /// `shawarma_service_acct_name` is configured
    pub kube_client: Option<Client>,
}

/// The mutation engine behind `/mutate`
#[derive(Debug)]
pub struct Mutator {
    sidecars: Arc<SidecarStore>,
    sidecar_monitor: parking_lot::Mutex<Option<SidecarMonitor>>,
    shawarma_image: String,
    native_sidecars: bool,
    shawarma_service_acct_name: Option<String>,
    shawarma_secret_token_name: Option<String>,
    service_acct_monitors: Option<ServiceAcctMonitorSet>,
}

/// Wire envelope of the admission response, tagged with the declared GVK
#[derive(Debug, Serialize)]
struct ReviewResponse {
    #[serde(flatten)]
    types: TypeMeta,
    response: MutationResponse,
}

/// Admission response payload in the Kubernetes wire shape. The patch is the
/// base64 of the JSON-Patch document, the encoding the API server expects
/// for byte sequences.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct MutationResponse {
    #[serde(skip_serializing_if = "String::is_empty")]
    uid: String,
    allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<ResponseStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    patch_type: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct ResponseStatus {
    message: String,
}

impl Mutator {
    /// Create the mutator: start the sidecar configuration monitor, its
    /// store-publishing consumer, and perform the initial template load
    pub async fn new(config: MutatorConfig) -> Result<Self> {
        if config.shawarma_image.is_empty() {
            return Err(Error::config("shawarma image is required"));
        }

        let (mut monitor, mut output) = SidecarMonitor::new(&config.sidecar_config_file)?;

        let sidecars = Arc::new(SidecarStore::new());
        let store = Arc::clone(&sidecars);
        tokio::spawn(async move {
            while let Some(map) = output.recv().await {
                store.publish(map);
                info!("sidecar configuration loaded");
            }
        });

        monitor.start().await;

        Ok(Self {
            sidecars,
            sidecar_monitor: parking_lot::Mutex::new(Some(monitor)),
            shawarma_image: config.shawarma_image,
            native_sidecars: config.native_sidecars,
            shawarma_service_acct_name: config
                .shawarma_service_acct_name
                .filter(|name| !name.is_empty()),
            shawarma_secret_token_name: config
                .shawarma_secret_token_name
                .filter(|name| !name.is_empty()),
            service_acct_monitors: config.kube_client.map(ServiceAcctMonitorSet::new),
        })
    }

    /// Snapshot of the currently published sidecar templates
    pub fn side_cars(&self) -> Arc<SidecarMap> {
        self.sidecars.load()
    }

    /// Stop the service-account monitors and the configuration watcher
    pub async fn shutdown(&self) {
        if let Some(monitors) = &self.service_acct_monitors {
            monitors.stop_all().await;
        }
        if let Some(mut monitor) = self.sidecar_monitor.lock().take() {
            monitor.shutdown();
        }
    }

    /// Process one admission review payload and encode the response review
    ///
    /// Decode failures are reported inside the admission envelope; this only
    /// fails if the response itself cannot be serialized.
    pub async fn mutate(&self, body: &[u8]) -> serde_json::Result<Vec<u8>> {
        let (types, decoded) = decode_request(body);

        let response = match decoded {
            Ok(request) => self.review(&request).await,
            Err(message) => {
                error!(message = %message, "failed to decode admission request");
                MutationResponse {
                    status: Some(ResponseStatus { message }),
                    ..Default::default()
                }
            }
        };

        serde_json::to_vec(&ReviewResponse { types, response })
    }

    async fn review(&self, request: &AdmissionRequest<Pod>) -> MutationResponse {
        info!(
            kind = ?request.kind,
            namespace = ?request.namespace,
            name = %request.name,
            uid = %request.uid,
            operation = ?request.operation,
            user = request.user_info.username.as_deref().unwrap_or_default(),
            "admission review"
        );

        let Some(pod) = request.object.as_ref() else {
            return self.error_response(&request.uid, "no pod object in admission request");
        };

        let namespace = request.namespace.clone().unwrap_or_default();

        let Some(side_car_names) = self.should_mutate(&pod.metadata, &namespace) else {
            return MutationResponse {
                uid: request.uid.clone(),
                allowed: true,
                ..Default::default()
            };
        };

        let annotations = BTreeMap::from([(
            STATUS_ANNOTATION.to_string(),
            INJECTED_VALUE.to_string(),
        )]);

        let patch = match self
            .create_patch(pod, &namespace, &side_car_names, &annotations)
            .await
        {
            Ok(patch) => patch,
            Err(e) => return self.error_response(&request.uid, &e.to_string()),
        };

        let patch_bytes = match serde_json::to_vec(&patch) {
            Ok(bytes) => bytes,
            Err(e) => {
                return self
                    .error_response(&request.uid, &format!("patch serialization error: {e}"))
            }
        };

        info!(
            uid = %request.uid,
            operations = patch.0.len(),
            "admission response patch"
        );
        debug!(patch = %String::from_utf8_lossy(&patch_bytes), "patch document");

        MutationResponse {
            uid: request.uid.clone(),
            allowed: true,
            patch: Some(BASE64_STANDARD.encode(&patch_bytes)),
            patch_type: Some(JSON_PATCH_TYPE),
            ..Default::default()
        }
    }

    fn error_response(&self, uid: &str, message: &str) -> MutationResponse {
        error!(uid = %uid, message = %message, "admission review failed");
        MutationResponse {
            uid: uid.to_string(),
            status: Some(ResponseStatus {
                message: message.to_string(),
            }),
            ..Default::default()
        }
    }

    /// Decide whether the pod gets injected and with which template names
    fn should_mutate(&self, metadata: &ObjectMeta, namespace: &str) -> Option<Vec<String>> {
        let pod_name = metadata
            .name
            .as_deref()
            .or(metadata.generate_name.as_deref())
            .unwrap_or_default();

        if let Some(pod_namespace) = metadata.namespace.as_deref() {
            if SYSTEM_NAMESPACES.contains(&pod_namespace) {
                info!(pod = %pod_name, namespace = %namespace, "skipping mutation for pod in system namespace");
                return None;
            }
        }

        let empty = BTreeMap::new();
        let annotations = metadata.annotations.as_ref().unwrap_or(&empty);

        if annotations
            .get(STATUS_ANNOTATION)
            .is_some_and(|status| status.eq_ignore_ascii_case(INJECTED_VALUE))
        {
            info!(pod = %pod_name, namespace = %namespace, "skipping mutation for pod, has been mutated already");
            return None;
        }

        // A mounted token needs the alternate sidecar shape
        let selected = if self.shawarma_secret_token_name.is_some()
            || self.shawarma_service_acct_name.is_some()
        {
            SIDECAR_WITH_TOKEN_NAME
        } else {
            SIDECAR_NAME
        };

        if let Some(service_name) = annotations.get(INJECT_ANNOTATION) {
            if !service_name.is_empty() {
                info!(
                    pod = %pod_name,
                    namespace = %namespace,
                    service_name = %service_name,
                    sidecar = %selected,
                    "shawarma injection for pod"
                );
                return Some(vec![selected.to_string()]);
            }
        }

        if let Some(service_labels) = annotations.get(LABEL_INJECT_ANNOTATION) {
            if !service_labels.is_empty() {
                info!(
                    pod = %pod_name,
                    namespace = %namespace,
                    service_labels = %service_labels,
                    sidecar = %selected,
                    "shawarma injection for pod"
                );
                return Some(vec![selected.to_string()]);
            }
        }

        info!(pod = %pod_name, namespace = %namespace, "skipping mutation for pod, no action required");
        None
    }

    /// Build the ordered JSON-Patch injecting the named sidecar templates
    async fn create_patch(
        &self,
        pod: &Pod,
        namespace: &str,
        side_car_names: &[String],
        annotations: &BTreeMap<String, String>,
    ) -> Result<Patch> {
        let mut shawarma_image = self.shawarma_image.clone();
        if let Some(image) = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(IMAGE_ANNOTATION))
        {
            info!(image = %image, "overriding shawarma image");
            shawarma_image = image.clone();
        }

        let secret_name = self.resolve_secret_name(namespace).await?;

        // One snapshot of the store backs the whole patch; a concurrent
        // reload cannot produce a half-updated injection.
        let side_cars = self.sidecars.load();

        let mut containers = Vec::new();
        let mut volumes = Vec::new();
        let mut image_pull_secrets = Vec::new();

        for name in side_car_names {
            let Some(side_car) = side_cars.get(name) else {
                return Err(Error::missing_sidecars(side_car_names.iter().cloned()));
            };
            let mut side_car = side_car.clone();

            for container in &mut side_car.containers {
                if let Some(image) = &container.image {
                    container.image = Some(image.replace(IMAGE_TOKEN, &shawarma_image));
                }
                if self.native_sidecars {
                    // restartPolicy Always makes an init container behave as
                    // a long-running sidecar (Kubernetes >= 1.29)
                    container.restart_policy = Some("Always".to_string());
                }
            }

            for volume in &mut side_car.volumes {
                if let Some(secret) = volume.secret.as_mut() {
                    if let Some(existing) = &secret.secret_name {
                        secret.secret_name = Some(existing.replace(TOKEN_NAME_TOKEN, &secret_name));
                    }
                }
            }

            containers.extend(side_car.containers);
            volumes.extend(side_car.volumes);
            image_pull_secrets.extend(side_car.image_pull_secrets);
        }

        let spec = pod.spec.as_ref();
        let existing_containers = spec.map_or(0, |s| s.containers.len());
        let existing_init_containers = spec
            .and_then(|s| s.init_containers.as_ref())
            .map_or(0, Vec::len);
        let existing_volumes = spec.and_then(|s| s.volumes.as_ref()).map_or(0, Vec::len);
        let existing_pull_secrets = spec
            .and_then(|s| s.image_pull_secrets.as_ref())
            .map_or(0, Vec::len);

        let mut operations = Vec::new();
        if self.native_sidecars {
            operations.extend(add_elements(
                existing_init_containers,
                &containers,
                &["spec", "initContainers"],
            )?);
        } else {
            operations.extend(add_elements(
                existing_containers,
                &containers,
                &["spec", "containers"],
            )?);
        }
        operations.extend(add_elements(existing_volumes, &volumes, &["spec", "volumes"])?);
        operations.extend(add_elements(
            existing_pull_secrets,
            &image_pull_secrets,
            &["spec", "imagePullSecrets"],
        )?);
        operations.extend(update_annotations(
            pod.metadata.annotations.as_ref(),
            annotations,
        ));

        Ok(Patch(operations))
    }

    async fn resolve_secret_name(&self, namespace: &str) -> Result<String> {
        if let Some(secret_name) = &self.shawarma_secret_token_name {
            return Ok(secret_name.clone());
        }

        let Some(account) = &self.shawarma_service_acct_name else {
            return Ok(String::new());
        };

        let monitors = self
            .service_acct_monitors
            .as_ref()
            .ok_or_else(|| Error::secret_not_found(namespace, account))?;
        let monitor = monitors.get(namespace, account, SECRET_WAIT_TIMEOUT).await?;

        let secret_name = monitor.secret_name();
        if secret_name.is_empty() {
            return Err(Error::secret_not_found(namespace, account));
        }

        debug!(
            secret_name = %secret_name,
            namespace = %namespace,
            service_account = %account,
            "using service token for service account"
        );
        Ok(secret_name)
    }
}

/// Decode the review payload, remembering the declared group-version-kind
///
/// A missing or empty GVK is defaulted to v1 before the typed decode; both
/// admission versions share the same wire shape, so either decodes into the
/// v1-shaped request.
fn decode_request(body: &[u8]) -> (TypeMeta, std::result::Result<AdmissionRequest<Pod>, String>) {
    let fallback = TypeMeta {
        api_version: ADMISSION_V1.to_string(),
        kind: REVIEW_KIND.to_string(),
    };

    let mut value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => return (fallback, Err(format!("failed to decode request: {e}"))),
    };

    if let Some(object) = value.as_object_mut() {
        for (key, default) in [("apiVersion", ADMISSION_V1), ("kind", REVIEW_KIND)] {
            let missing = object
                .get(key)
                .and_then(Value::as_str)
                .is_none_or(str::is_empty);
            if missing {
                object.insert(key.to_string(), Value::String(default.to_string()));
            }
        }
    }

    let types = TypeMeta {
        api_version: value
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or(ADMISSION_V1)
            .to_string(),
        kind: value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or(REVIEW_KIND)
            .to_string(),
    };

    let review: AdmissionReview<Pod> = match serde_json::from_value(value) {
        Ok(review) => review,
        Err(e) => return (types, Err(format!("failed to decode request: {e}"))),
    };

    match review.try_into() {
        Ok(request) => (types, Ok(request)),
        Err(e) => (types, Err(format!("failed to decode request: {e}"))),
    }
}

/// Emit `add` operations appending `added` under `base_path`
///
/// The first addition into an empty slice establishes the array with a
/// single-element value; every other addition appends through the `-` index.
fn add_elements<T: Serialize>(
    existing: usize,
    added: &[T],
    base_path: &[&str],
) -> Result<Vec<PatchOperation>> {
    let mut operations = Vec::with_capacity(added.len());
    let mut first = existing == 0;

    for element in added {
        let value = serde_json::to_value(element).map_err(|e| Error::serialization(e.to_string()))?;
        if first {
            first = false;
            operations.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(base_path.iter().copied()),
                value: Value::Array(vec![value]),
            }));
        } else {
            operations.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(base_path.iter().copied().chain(["-"])),
                value,
            }));
        }
    }

    Ok(operations)
}

/// Emit one `add` or `replace` per annotation, depending on key presence
fn update_annotations(
    existing: Option<&BTreeMap<String, String>>,
    added: &BTreeMap<String, String>,
) -> Vec<PatchOperation> {
    added
        .iter()
        .map(|(key, value)| {
            // from_tokens applies the JSON Pointer escaping for the / in the
            // annotation key
            let path = PointerBuf::from_tokens(["metadata", "annotations", key.as_str()]);
            let value = Value::String(value.clone());
            if existing.is_some_and(|annotations| annotations.contains_key(key)) {
                PatchOperation::Replace(ReplaceOperation { path, value })
            } else {
                PatchOperation::Add(AddOperation { path, value })
            }
        })
        .collect()
}
