use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use crate::config::PolicyConfig;

use super::{pod_name, PodFilter};

/// Skips pods labeled `<label>=<value>`, by default
/// `pod-security.kubernetes.io/enforce=privileged`.
#[derive(Debug, Clone)]
pub struct OptOutLabel {
    label: String,
    value: String,
}

impl OptOutLabel {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            label: config.opt_out_label.clone(),
            value: config.opt_out_value.clone(),
        }
    }
}

impl PodFilter for OptOutLabel {
    fn should_mutate(&self, pod: &Pod) -> bool {
        let opted_out = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&self.label))
            .is_some_and(|value| *value == self.value);

        if opted_out {
            debug!(
                pod = pod_name(pod),
                label = %self.label,
                value = %self.value,
                "pod opted out of security defaulting"
            );
        }
        !opted_out
    }
}
