//! Kubernetes API access used by the harness.
//!
//! [`ControlPlane`] is the seam between the harness and the API server;
//! [`KubeControlPlane`] is the kube-rs implementation.

use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{Api, AttachParams, DynamicObject, ListParams, LogParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::{Discovery, Scope};
use kube::{Client, Config};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::error::ControlPlaneError;
use crate::pod::PodSnapshot;

/// Field manager recorded on server-side applied objects.
const FIELD_MANAGER: &str = "ndm-e2e";

/// One document of a manifest, ready for server-side apply.
#[derive(Debug)]
struct ManifestObject {
    gvk: GroupVersionKind,
    name: String,
    object: DynamicObject,
}

/// Split a multi-document manifest into named, typed objects. Empty
/// documents are skipped.
fn parse_objects(manifest: &str) -> Result<Vec<ManifestObject>, ControlPlaneError> {
    let mut objects = Vec::new();

    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| ControlPlaneError::Document(e.to_string()))?;
        if value.is_null() {
            continue;
        }

        let object: DynamicObject = serde_yaml::from_value(value)
            .map_err(|e| ControlPlaneError::Document(e.to_string()))?;
        let types = object
            .types
            .as_ref()
            .ok_or_else(|| ControlPlaneError::Document("missing apiVersion or kind".into()))?;
        let gvk = GroupVersionKind::try_from(types)
            .map_err(|e| ControlPlaneError::Document(e.to_string()))?;
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| ControlPlaneError::Document(format!("{} without a name", gvk.kind)))?;

        objects.push(ManifestObject { gvk, name, object });
    }

    Ok(objects)
}

/// Operations the harness needs from the cluster's API server.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// First pod in `namespace` whose name starts with `prefix`.
    async fn find_pod(
        &self,
        namespace: &str,
        prefix: &str,
    ) -> Result<Option<PodSnapshot>, ControlPlaneError>;

    /// Server-side apply every document of a multi-document YAML manifest.
    /// Namespaced objects without a namespace go to `default_namespace`.
    async fn apply_manifest(
        &self,
        manifest: &str,
        default_namespace: &str,
    ) -> Result<(), ControlPlaneError>;

    /// Run `command` in the pod's first container and return its stdout.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<String, ControlPlaneError>;

    /// Current log of the pod's first container.
    async fn logs(&self, namespace: &str, pod: &str) -> Result<String, ControlPlaneError>;

    /// Phase of a namespace, or `None` if it does not exist.
    async fn namespace_phase(&self, namespace: &str) -> Result<Option<String>, ControlPlaneError>;
}

/// [`ControlPlane`] backed by a kube-rs [`Client`].
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    /// Build a client from `kubeconfig`, or from the environment when
    /// `None`, and check that the API server answers.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError::Connect`] if the configuration cannot be
    /// loaded or the API server is unreachable.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self, ControlPlaneError> {
        let client = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ControlPlaneError::Connect(format!(
                        "failed to read kubeconfig from {}: {e}",
                        path.display()
                    ))
                })?;
                let config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| ControlPlaneError::Connect(e.to_string()))?;
                Client::try_from(config).map_err(|e| ControlPlaneError::Connect(e.to_string()))?
            }
            None => Client::try_default()
                .await
                .map_err(|e| ControlPlaneError::Connect(e.to_string()))?,
        };

        let version = client
            .apiserver_version()
            .await
            .map_err(|e| ControlPlaneError::Connect(e.to_string()))?;
        info!(version = %version.git_version, "Connected to API server");

        Ok(Self { client })
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn find_pod(
        &self,
        namespace: &str,
        prefix: &str,
    ) -> Result<Option<PodSnapshot>, ControlPlaneError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods.list(&ListParams::default()).await?;

        Ok(list
            .items
            .iter()
            .find(|pod| {
                pod.metadata
                    .name
                    .as_deref()
                    .is_some_and(|name| name.starts_with(prefix))
            })
            .map(PodSnapshot::from_pod))
    }

    async fn apply_manifest(
        &self,
        manifest: &str,
        default_namespace: &str,
    ) -> Result<(), ControlPlaneError> {
        let objects = parse_objects(manifest)?;
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let params = PatchParams::apply(FIELD_MANAGER).force();

        for ManifestObject { gvk, name, object } in objects {
            let (resource, capabilities) = discovery
                .resolve_gvk(&gvk)
                .ok_or_else(|| ControlPlaneError::Document(format!("unknown kind {}", gvk.kind)))?;

            let api: Api<DynamicObject> = if capabilities.scope == Scope::Namespaced {
                let namespace = object
                    .metadata
                    .namespace
                    .as_deref()
                    .unwrap_or(default_namespace);
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            } else {
                Api::all_with(self.client.clone(), &resource)
            };

            api.patch(&name, &params, &Patch::Apply(&object)).await?;
            debug!(kind = %gvk.kind, name = %name, "Applied object");
        }

        Ok(())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<String, ControlPlaneError> {
        let exec_error = |message: String| ControlPlaneError::Exec {
            pod: pod.to_string(),
            message,
        };

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut attached = pods
            .exec(pod, command.to_vec(), &AttachParams::default().stderr(false))
            .await?;

        let mut stdout = attached
            .stdout()
            .ok_or_else(|| exec_error("stdout not attached".into()))?;
        let status = attached.take_status();

        let mut output = String::new();
        stdout
            .read_to_string(&mut output)
            .await
            .map_err(|e| exec_error(e.to_string()))?;

        if let Some(status) = status {
            if let Some(status) = status.await {
                if status.status.as_deref() == Some("Failure") {
                    return Err(exec_error(status.message.unwrap_or_default()));
                }
            }
        }

        attached
            .join()
            .await
            .map_err(|e| exec_error(e.to_string()))?;

        Ok(output)
    }

    async fn logs(&self, namespace: &str, pod: &str) -> Result<String, ControlPlaneError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.logs(pod, &LogParams::default()).await?)
    }

    async fn namespace_phase(&self, namespace: &str) -> Result<Option<String>, ControlPlaneError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let found = namespaces.get_opt(namespace).await?;

        Ok(found.map(|ns| ns.status.and_then(|s| s.phase).unwrap_or_default()))
    }
}
