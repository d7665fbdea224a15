use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::core::DynamicObject;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::PolicyConfig;
use crate::patch::{PatchError, PatchSet};
use crate::policies::mutator::SecurityContextMutator;
use crate::policies::opt_out::OptOutLabel;
use crate::policies::pod_security::pod_security_context_pointer;
use crate::policies::{pod_name, PodFilter};

const POD_GROUP: &str = "";
const POD_VERSION: &str = "v1";
const POD_RESOURCE: &str = "pods";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("expected resource to be pods/v1, got '{resource}' in group '{group}' version '{version}'")]
    UnexpectedResource {
        group: String,
        version: String,
        resource: String,
    },
}

/// Outcome of one admission request.
pub struct Decision {
    pub response: AdmissionResponse,
    pub patch_operations: PatchCounts,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PatchCounts {
    pub pod: usize,
    pub container: usize,
}

impl PatchCounts {
    fn of(patches: &PatchSet) -> Self {
        let pod_path = pod_security_context_pointer();
        let pod = patches
            .paths()
            .filter(|path| *path == pod_path.as_str())
            .count();
        Self {
            pod,
            container: patches.len() - pod,
        }
    }

    pub fn total(&self) -> usize {
        self.pod + self.container
    }
}

pub struct AdmissionEngine {
    filter: Box<dyn PodFilter>,
    mutator: SecurityContextMutator,
}

impl AdmissionEngine {
    pub fn new(config: &PolicyConfig) -> Self {
        Self::with_filter(OptOutLabel::new(config), SecurityContextMutator::new(config))
    }

    pub fn with_filter(filter: impl PodFilter + 'static, mutator: SecurityContextMutator) -> Self {
        Self {
            filter: Box::new(filter),
            mutator,
        }
    }

    /// Allows every decodable pod, attaching a JSON Patch when defaults are missing.
    pub fn review(&self, request: &AdmissionRequest<DynamicObject>) -> Result<Decision, EngineError> {
        let resource = &request.resource;
        if resource.group != POD_GROUP
            || resource.version != POD_VERSION
            || resource.resource != POD_RESOURCE
        {
            error!(
                uid = %request.uid,
                group = %resource.group,
                version = %resource.version,
                resource = %resource.resource,
                "expected resource to be pods"
            );
            return Err(EngineError::UnexpectedResource {
                group: resource.group.clone(),
                version: resource.version.clone(),
                resource: resource.resource.clone(),
            });
        }

        let pod = match decode_pod(request.object.as_ref()) {
            Ok(pod) => pod,
            Err(message) => {
                warn!(uid = %request.uid, "{message}");
                return Ok(Decision {
                    response: AdmissionResponse::from(request).deny(message),
                    patch_operations: PatchCounts::default(),
                });
            }
        };

        let patches = match self.patches_for(&pod) {
            Ok(patches) => patches,
            Err(e) => {
                error!(uid = %request.uid, pod = pod_name(&pod), "security defaulting failed: {e}");
                PatchSet::new()
            }
        };

        let response = AdmissionResponse::from(request);
        if patches.is_empty() {
            return Ok(Decision {
                response,
                patch_operations: PatchCounts::default(),
            });
        }

        let counts = PatchCounts::of(&patches);
        match patches.to_document() {
            Ok(document) => debug!(
                uid = %request.uid,
                pod = pod_name(&pod),
                operations = counts.total(),
                patch = %String::from_utf8_lossy(&document),
                "patching pod"
            ),
            Err(e) => error!(uid = %request.uid, "{e}"),
        }

        match response.with_patch(patches.into_patch()) {
            Ok(patched) => Ok(Decision {
                response: patched,
                patch_operations: counts,
            }),
            Err(e) => {
                error!(uid = %request.uid, "failed to serialize patches: {e}");
                Ok(Decision {
                    response: AdmissionResponse::from(request),
                    patch_operations: PatchCounts::default(),
                })
            }
        }
    }

    /// Filter then mutate. Empty when the pod opted out or is already hardened.
    pub fn patches_for(&self, pod: &Pod) -> Result<PatchSet, PatchError> {
        let mut patches = PatchSet::new();
        if self.filter.should_mutate(pod) {
            self.mutator.mutate(pod, &mut patches)?;
        }
        Ok(patches)
    }
}

fn decode_pod(object: Option<&DynamicObject>) -> Result<Pod, String> {
    let object = object.ok_or_else(|| "admission request carries no object".to_string())?;
    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .map_err(|e| format!("failed to decode pod: {e}"))
}

#[cfg(test)]
mod tests {
    use kube::core::admission::AdmissionReview;
    use serde_json::{json, Value};

    use super::*;

    fn request(resource: Value, object: Value) -> AdmissionRequest<DynamicObject> {
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": resource,
                "name": "web",
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": {"username": "admin"},
                "object": object,
                "dryRun": false
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    fn pods() -> Value {
        json!({"group": "", "version": "v1", "resource": "pods"})
    }

    fn pod(labels: Value, spec: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "web", "namespace": "default", "labels": labels},
            "spec": spec
        })
    }

    fn hardened_spec() -> Value {
        json!({
            "securityContext": {
                "runAsUser": 1000,
                "runAsGroup": 1000,
                "runAsNonRoot": true,
                "fsGroup": 1000,
                "seccompProfile": {"type": "RuntimeDefault"}
            },
            "containers": [{
                "name": "app",
                "image": "nginx",
                "securityContext": {
                    "allowPrivilegeEscalation": false,
                    "capabilities": {"drop": ["ALL"]}
                }
            }]
        })
    }

    fn response_json(decision: Decision) -> Value {
        serde_json::to_value(decision.response.into_review()).unwrap()["response"].clone()
    }

    fn engine() -> AdmissionEngine {
        AdmissionEngine::new(&PolicyConfig::default())
    }

    #[test]
    fn test_bare_pod_is_patched() {
        let req = request(
            pods(),
            pod(json!({}), json!({"containers": [{"name": "app", "image": "nginx"}]})),
        );
        let decision = engine().review(&req).unwrap();
        assert_eq!(decision.patch_operations, PatchCounts { pod: 1, container: 1 });

        let response = response_json(decision);
        assert_eq!(response["allowed"], true);
        assert_eq!(response["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(response["patchType"], "JSONPatch");

        let bytes: Vec<u8> = serde_json::from_value(response["patch"].clone()).unwrap();
        let operations: Value = serde_json::from_slice(&bytes).unwrap();
        let operations = operations.as_array().unwrap();
        assert_eq!(operations.len(), 2);
        assert_eq!(operations[0]["op"], "add");
        assert_eq!(operations[0]["path"], "/spec/securityContext");
        assert_eq!(operations[0]["value"]["runAsUser"], 1000);
        assert_eq!(operations[1]["op"], "add");
        assert_eq!(operations[1]["path"], "/spec/containers/0/securityContext");
    }

    #[test]
    fn test_counts_split_pod_and_container_patches() {
        let pod: Pod = serde_json::from_value(pod(
            json!({}),
            json!({
                "initContainers": [{"name": "init", "image": "busybox"}],
                "containers": [{"name": "a", "image": "nginx"}, {"name": "b", "image": "nginx"}]
            }),
        ))
        .unwrap();

        let patches = engine().patches_for(&pod).unwrap();
        assert_eq!(PatchCounts::of(&patches), PatchCounts { pod: 1, container: 3 });
    }

    #[test]
    fn test_privileged_pod_is_allowed_unchanged() {
        let req = request(
            pods(),
            pod(
                json!({"pod-security.kubernetes.io/enforce": "privileged"}),
                json!({"containers": [{"name": "app", "image": "nginx"}]}),
            ),
        );
        let decision = engine().review(&req).unwrap();
        assert_eq!(decision.patch_operations.total(), 0);

        let response = response_json(decision);
        assert_eq!(response["allowed"], true);
        assert!(response.get("patch").is_none());
        assert!(response.get("patchType").is_none());
    }

    #[test]
    fn test_hardened_pod_has_no_patch_fields() {
        let req = request(pods(), pod(json!({}), hardened_spec()));
        let response = response_json(engine().review(&req).unwrap());

        assert_eq!(response["allowed"], true);
        assert!(response.get("patch").is_none());
        assert!(response.get("patchType").is_none());
    }

    #[test]
    fn test_other_resource_is_an_error() {
        let req = request(
            json!({"group": "apps", "version": "v1", "resource": "deployments"}),
            json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web"}}),
        );
        let err = engine().review(&req).err().unwrap();
        assert!(matches!(
            err,
            EngineError::UnexpectedResource { ref resource, .. } if resource == "deployments"
        ));
    }

    #[test]
    fn test_undecodable_pod_is_denied() {
        let req = request(
            pods(),
            json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "web"},
                "spec": {"containers": "not-a-list"}
            }),
        );
        let response = response_json(engine().review(&req).unwrap());

        assert_eq!(response["allowed"], false);
        assert!(response.to_string().contains("failed to decode pod"));
    }

    #[test]
    fn test_injected_filter_replaces_label_policy() {
        let engine = AdmissionEngine::with_filter(
            |_: &Pod| false,
            SecurityContextMutator::new(&PolicyConfig::default()),
        );
        let pod: Pod = serde_json::from_value(pod(
            json!({}),
            json!({"containers": [{"name": "app", "image": "nginx"}]}),
        ))
        .unwrap();

        assert!(engine.patches_for(&pod).unwrap().is_empty());
    }

    #[test]
    fn test_patch_document_order() {
        let pod: Pod = serde_json::from_value(pod(
            json!({"pod-security.kubernetes.io/enforce": "baseline"}),
            json!({
                "initContainers": [{"name": "init", "image": "busybox"}],
                "containers": [{"name": "app", "image": "nginx"}]
            }),
        ))
        .unwrap();

        let document: Value =
            serde_json::from_slice(&engine().patches_for(&pod).unwrap().to_document().unwrap())
                .unwrap();
        let paths: Vec<&str> = document
            .as_array()
            .unwrap()
            .iter()
            .map(|op| op["path"].as_str().unwrap())
            .collect();
        assert_eq!(
            paths,
            vec![
                "/spec/securityContext",
                "/spec/initContainers/0/securityContext",
                "/spec/containers/0/securityContext",
            ]
        );
    }
}
