pub mod container_security;
pub mod mutator;
pub mod opt_out;
pub mod pod_security;

use std::fmt;

use json_patch::jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::Pod;

/// Decides whether a pod should be mutated at all.
pub trait PodFilter: Send + Sync {
    fn should_mutate(&self, pod: &Pod) -> bool;
}

impl<F> PodFilter for F
where
    F: Fn(&Pod) -> bool + Send + Sync,
{
    fn should_mutate(&self, pod: &Pod) -> bool {
        self(pod)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerList {
    InitContainers,
    Containers,
}

impl ContainerList {
    pub fn field(self) -> &'static str {
        match self {
            ContainerList::InitContainers => "initContainers",
            ContainerList::Containers => "containers",
        }
    }
}

/// Position of a container within its own list of the pod spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerPath {
    pub list: ContainerList,
    pub index: usize,
}

impl ContainerPath {
    pub fn new(list: ContainerList, index: usize) -> Self {
        Self { list, index }
    }

    pub fn security_context(&self) -> PointerBuf {
        let index = self.index.to_string();
        PointerBuf::from_tokens(["spec", self.list.field(), index.as_str(), "securityContext"])
    }
}

impl fmt::Display for ContainerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/spec/{}/{}", self.list.field(), self.index)
    }
}

pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata
        .name
        .as_deref()
        .or(pod.metadata.generate_name.as_deref())
        .unwrap_or("<unknown>")
}
