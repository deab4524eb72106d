//! Sidecar template definitions and the configuration file loader

use std::collections::HashMap;
use std::path::Path;

use k8s_openapi::api::core::v1::{Container, LocalObjectReference, Volume};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Template of a sidecar to be injected into a pod
///
/// Container and volume shapes are the Kubernetes pod sub-schemas. Image
/// strings may carry the `|SHAWARMA_IMAGE|` marker and secret volume names
/// the `|SHAWARMA_TOKEN_NAME|` marker; both are substituted at patch time on
/// a clone of the template, never on the stored value.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Sidecar {
    /// Containers appended to the pod
    pub containers: Vec<Container>,
    /// Volumes appended to the pod
    pub volumes: Vec<Volume>,
    /// Image pull secrets appended to the pod
    pub image_pull_secrets: Vec<LocalObjectReference>,
}

/// Mapping from template name to sidecar template, published as a whole
pub type SidecarMap = HashMap<String, Sidecar>;

#[derive(Debug, Deserialize)]
struct NamedSidecar {
    name: String,
    sidecar: Sidecar,
}

/// Top-level shape of the sidecar configuration file. Unknown keys are
/// ignored.
#[derive(Debug, Default, Deserialize)]
struct SidecarConfigFile {
    #[serde(default)]
    sidecars: Vec<NamedSidecar>,
}

/// Load the sidecar configuration file into a template map
///
/// The file is a YAML (or JSON) document of shape
/// `{ sidecars: [ { name, sidecar: { containers, volumes, imagePullSecrets } } ] }`.
/// Duplicate names keep the last occurrence. A missing file or parse error
/// returns an error and changes nothing.
pub fn load_sidecars(path: &Path) -> Result<SidecarMap> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::sidecar_config(path.display().to_string(), e.to_string()))?;
    debug!(file = %path.display(), bytes = data.len(), "read sidecar configuration");

    let cfg: SidecarConfigFile = serde_yaml::from_str(&data)
        .map_err(|e| Error::sidecar_config(path.display().to_string(), e.to_string()))?;

    let mut map = SidecarMap::with_capacity(cfg.sidecars.len());
    for entry in cfg.sidecars {
        map.insert(entry.name, entry.sidecar);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_yaml_config() {
        let file = write_config(
            r#"
sidecars:
  - name: shawarma
    sidecar:
      containers:
        - name: shawarma
          image: "|SHAWARMA_IMAGE|"
  - name: shawarma-withtoken
    sidecar:
      containers:
        - name: shawarma
          image: "|SHAWARMA_IMAGE|"
      volumes:
        - name: token
          secret:
            secretName: "|SHAWARMA_TOKEN_NAME|"
      imagePullSecrets:
        - name: registry-creds
"#,
        );

        let map = load_sidecars(file.path()).unwrap();
        assert_eq!(map.len(), 2);

        let plain = &map["shawarma"];
        assert_eq!(plain.containers.len(), 1);
        assert_eq!(plain.containers[0].image.as_deref(), Some("|SHAWARMA_IMAGE|"));
        assert!(plain.volumes.is_empty());

        let with_token = &map["shawarma-withtoken"];
        assert_eq!(with_token.volumes.len(), 1);
        let secret = with_token.volumes[0].secret.as_ref().unwrap();
        assert_eq!(secret.secret_name.as_deref(), Some("|SHAWARMA_TOKEN_NAME|"));
        assert_eq!(with_token.image_pull_secrets.len(), 1);
    }

    #[test]
    fn loads_json_config() {
        let file = write_config(
            r#"{"sidecars":[{"name":"shawarma","sidecar":{"containers":[{"name":"shawarma","image":"img"}]}}]}"#,
        );

        let map = load_sidecars(file.path()).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["shawarma"].containers[0].image.as_deref(), Some("img"));
    }

    #[test]
    fn duplicate_names_keep_last() {
        let file = write_config(
            r#"
sidecars:
  - name: shawarma
    sidecar:
      containers:
        - name: first
          image: "one"
  - name: shawarma
    sidecar:
      containers:
        - name: second
          image: "two"
"#,
        );

        let map = load_sidecars(file.path()).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["shawarma"].containers[0].name, "second");
    }

    #[test]
    fn unknown_top_level_keys_ignored() {
        let file = write_config(
            r#"
apiVersion: ignored/v1
sidecars:
  - name: shawarma
    sidecar: {}
"#,
        );

        let map = load_sidecars(file.path()).unwrap();
        assert!(map.contains_key("shawarma"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = load_sidecars(Path::new("/nonexistent/sidecar.yaml")).unwrap_err();
        assert!(matches!(err, Error::SidecarConfig { .. }));
    }

    #[test]
    fn parse_error_is_an_error() {
        let file = write_config("sidecars: [ not valid");
        let err = load_sidecars(file.path()).unwrap_err();
        assert!(matches!(err, Error::SidecarConfig { .. }));
    }
}
