//! Test manifest preparation.
//!
//! The daemon's base manifest is rewritten to run the locally built image
//! and written to a fixed path that the apply and cleanup steps share.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;
use tracing::{debug, info};

/// Where the prepared manifest is written unless configured otherwise.
pub const TEST_MANIFEST_PATH: &str = "/tmp/NDM_Test_node-disk-manager.yaml";

/// Pull policy that lets the cluster use the image already on the host.
pub const PULL_POLICY: &str = "IfNotPresent";

/// Container image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// Errors from preparing the test manifest.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("manifest has no document with a pod template")]
    NoPodTemplate,

    #[error("manifest has {0} documents with a pod template, expected exactly one")]
    MultiplePodTemplates(usize),

    #[error("pod template has {0} containers, expected exactly one")]
    ContainerCount(usize),

    #[error("pod template container is not a mapping")]
    InvalidContainer,

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Read `base`, point its single container at `image` and write the result
/// to `target`.
///
/// # Errors
///
/// Returns [`ManifestError`] if the manifest cannot be read, parsed or
/// written, or if it does not contain exactly one pod template with exactly
/// one container.
pub fn prepare_manifest(base: &Path, target: &Path, image: &ImageRef) -> Result<(), ManifestError> {
    let text = std::fs::read_to_string(base).map_err(|source| ManifestError::Read {
        path: base.to_path_buf(),
        source,
    })?;

    let rendered = rewrite_manifest(&text, image)?;

    std::fs::write(target, rendered).map_err(|source| ManifestError::Write {
        path: target.to_path_buf(),
        source,
    })?;

    info!(
        base = %base.display(),
        target = %target.display(),
        image = %image,
        "Prepared test manifest"
    );
    Ok(())
}

/// Rewrite the image and pull policy of the manifest's only container.
///
/// # Errors
///
/// See [`prepare_manifest`].
pub fn rewrite_manifest(text: &str, image: &ImageRef) -> Result<String, ManifestError> {
    let mut documents = serde_yaml::Deserializer::from_str(text)
        .map(Value::deserialize)
        .collect::<Result<Vec<_>, _>>()?;
    documents.retain(|doc| !doc.is_null());

    let templated: Vec<usize> = documents
        .iter()
        .enumerate()
        .filter(|(_, doc)| containers(doc).is_some())
        .map(|(i, _)| i)
        .collect();

    let index = match templated.as_slice() {
        [] => return Err(ManifestError::NoPodTemplate),
        [index] => *index,
        many => return Err(ManifestError::MultiplePodTemplates(many.len())),
    };

    let containers = containers_mut(&mut documents[index]).ok_or(ManifestError::NoPodTemplate)?;
    if containers.len() != 1 {
        return Err(ManifestError::ContainerCount(containers.len()));
    }

    let container = containers[0]
        .as_mapping_mut()
        .ok_or(ManifestError::InvalidContainer)?;
    container.insert("image".into(), image.to_string().into());
    container.insert("imagePullPolicy".into(), PULL_POLICY.into());
    debug!(document = index, image = %image, "Rewrote container image");

    let rendered = documents
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rendered.join("---\n"))
}

fn containers(doc: &Value) -> Option<&Vec<Value>> {
    doc.get("spec")?
        .get("template")?
        .get("spec")?
        .get("containers")?
        .as_sequence()
}

fn containers_mut(doc: &mut Value) -> Option<&mut Vec<Value>> {
    doc.get_mut("spec")?
        .get_mut("template")?
        .get_mut("spec")?
        .get_mut("containers")?
        .as_sequence_mut()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAEMONSET: &str = r"
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: node-disk-manager
spec:
  selector:
    matchLabels:
      name: node-disk-manager
  template:
    metadata:
      labels:
        name: node-disk-manager
    spec:
      containers:
      - name: node-disk-manager
        image: openebs/node-disk-manager-amd64:ci
        imagePullPolicy: Always
        securityContext:
          privileged: true
";

    fn image() -> ImageRef {
        ImageRef {
            name: "openebs/node-disk-manager-amd64".into(),
            tag: "v0.1.0-12-gabc1234".into(),
        }
    }

    fn only_container(rendered: &str) -> Value {
        let docs: Vec<Value> = serde_yaml::Deserializer::from_str(rendered)
            .map(Value::deserialize)
            .collect::<Result<_, _>>()
            .unwrap();
        let doc = docs
            .into_iter()
            .find(|d| containers(d).is_some())
            .unwrap();
        containers(&doc).unwrap()[0].clone()
    }

    #[test]
    fn test_rewrites_image_and_pull_policy() {
        let rendered = rewrite_manifest(DAEMONSET, &image()).unwrap();
        let container = only_container(&rendered);

        assert_eq!(
            container["image"].as_str(),
            Some("openebs/node-disk-manager-amd64:v0.1.0-12-gabc1234")
        );
        assert_eq!(container["imagePullPolicy"].as_str(), Some(PULL_POLICY));
        assert_eq!(container["securityContext"]["privileged"].as_bool(), Some(true));
    }

    #[test]
    fn test_multi_document_manifest_keeps_other_documents() {
        let text = format!(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: node-disk-manager-config\ndata:\n  node-disk-manager.config: |\n    probeconfigs: []\n---\n{DAEMONSET}---\n"
        );

        let rendered = rewrite_manifest(&text, &image()).unwrap();
        let docs: Vec<Value> = serde_yaml::Deserializer::from_str(&rendered)
            .map(Value::deserialize)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["kind"].as_str(), Some("ConfigMap"));
        assert_eq!(
            only_container(&rendered)["image"].as_str(),
            Some("openebs/node-disk-manager-amd64:v0.1.0-12-gabc1234")
        );
    }

    #[test]
    fn test_rejects_wrong_container_count() {
        let none = DAEMONSET.replace(
            "      containers:\n      - name: node-disk-manager\n        image: openebs/node-disk-manager-amd64:ci\n        imagePullPolicy: Always\n        securityContext:\n          privileged: true\n",
            "      containers: []\n",
        );
        assert!(matches!(
            rewrite_manifest(&none, &image()),
            Err(ManifestError::ContainerCount(0))
        ));

        let two = format!("{DAEMONSET}      - name: sidecar\n        image: busybox\n");
        assert!(matches!(
            rewrite_manifest(&two, &image()),
            Err(ManifestError::ContainerCount(2))
        ));
    }

    #[test]
    fn test_rejects_missing_or_duplicate_templates() {
        let no_template = "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: ndm\n";
        assert!(matches!(
            rewrite_manifest(no_template, &image()),
            Err(ManifestError::NoPodTemplate)
        ));

        let twice = format!("{DAEMONSET}---\n{DAEMONSET}");
        assert!(matches!(
            rewrite_manifest(&twice, &image()),
            Err(ManifestError::MultiplePodTemplates(2))
        ));
    }

    #[test]
    fn test_prepare_writes_target_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("node-disk-manager.yaml");
        let target = dir.path().join("NDM_Test_node-disk-manager.yaml");
        std::fs::write(&base, DAEMONSET).unwrap();

        prepare_manifest(&base, &target, &image()).unwrap();

        let written = std::fs::read_to_string(&target).unwrap();
        assert!(written.contains("imagePullPolicy: IfNotPresent"));
        assert!(written.contains("openebs/node-disk-manager-amd64:v0.1.0-12-gabc1234"));
    }

    #[test]
    fn test_prepare_reports_missing_base() {
        let dir = tempfile::tempdir().unwrap();
        let err = prepare_manifest(
            &dir.path().join("missing.yaml"),
            &dir.path().join("out.yaml"),
            &image(),
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Read { .. }));
    }
}
