use k8s_openapi::api::core::v1::{Container, Pod};

use crate::config::PolicyConfig;
use crate::patch::{PatchError, PatchSet};

use super::container_security::default_container_security_context;
use super::pod_security::default_pod_security_context;
use super::{ContainerList, ContainerPath};

/// Applies the pod-level defaults, then every init container, then every
/// app container, each in its list order. The first error aborts the rest.
#[derive(Debug, Clone)]
pub struct SecurityContextMutator {
    default_uid: i64,
}

impl SecurityContextMutator {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            default_uid: config.default_uid,
        }
    }

    pub fn mutate(&self, pod: &Pod, patches: &mut PatchSet) -> Result<(), PatchError> {
        default_pod_security_context(pod, self.default_uid, patches)?;

        let spec = match &pod.spec {
            Some(spec) => spec,
            None => return Ok(()),
        };

        let init_containers = spec.init_containers.as_deref().unwrap_or_default();
        mutate_containers(ContainerList::InitContainers, init_containers, patches)?;
        mutate_containers(ContainerList::Containers, &spec.containers, patches)
    }
}

fn mutate_containers(
    list: ContainerList,
    containers: &[Container],
    patches: &mut PatchSet,
) -> Result<(), PatchError> {
    for (index, container) in containers.iter().enumerate() {
        default_container_security_context(ContainerPath::new(list, index), container, patches)?;
    }
    Ok(())
}
