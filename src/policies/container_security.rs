use k8s_openapi::api::core::v1::{Capabilities, Container, SecurityContext};
use tracing::debug;

use crate::patch::{PatchError, PatchOp, PatchSet};

use super::ContainerPath;

pub const DROP_ALL: &str = "ALL";

/// Disables privilege escalation and drops all capabilities unless the
/// container already says otherwise. An existing `capabilities` record is
/// left exactly as written.
pub fn default_container_security_context(
    path: ContainerPath,
    container: &Container,
    patches: &mut PatchSet,
) -> Result<(), PatchError> {
    let op = PatchOp::for_existing(container.security_context.is_some());
    let mut sc: SecurityContext = container.security_context.clone().unwrap_or_default();
    let mut modified = false;

    if sc.allow_privilege_escalation.is_none() {
        sc.allow_privilege_escalation = Some(false);
        modified = true;
    }
    if sc.capabilities.is_none() {
        sc.capabilities = Some(Capabilities {
            drop: Some(vec![DROP_ALL.to_string()]),
            ..Capabilities::default()
        });
        modified = true;
    }

    if !modified {
        return Ok(());
    }

    debug!(
        container = %container.name,
        %path,
        op = op.as_str(),
        "defaulting container securityContext"
    );
    patches.append(op, path.security_context(), &sc)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::policies::ContainerList;

    fn container(sc: Option<SecurityContext>) -> Container {
        Container {
            name: "app".to_string(),
            security_context: sc,
            ..Container::default()
        }
    }

    fn run(path: ContainerPath, container: &Container) -> Vec<Value> {
        let mut patches = PatchSet::new();
        default_container_security_context(path, container, &mut patches).unwrap();
        patches
            .operations()
            .iter()
            .map(|op| serde_json::to_value(op).unwrap())
            .collect()
    }

    #[test]
    fn test_absent_context_is_added() {
        let ops = run(ContainerPath::new(ContainerList::Containers, 2), &container(None));
        assert_eq!(
            ops,
            vec![json!({
                "op": "add",
                "path": "/spec/containers/2/securityContext",
                "value": {
                    "allowPrivilegeEscalation": false,
                    "capabilities": {"drop": ["ALL"]}
                }
            })]
        );
    }

    #[test]
    fn test_partial_context_is_replaced() {
        let sc = SecurityContext {
            read_only_root_filesystem: Some(true),
            allow_privilege_escalation: Some(true),
            ..SecurityContext::default()
        };
        let ops = run(ContainerPath::new(ContainerList::InitContainers, 0), &container(Some(sc)));

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0]["op"], "replace");
        assert_eq!(ops[0]["path"], "/spec/initContainers/0/securityContext");
        assert_eq!(ops[0]["value"]["allowPrivilegeEscalation"], true);
        assert_eq!(ops[0]["value"]["readOnlyRootFilesystem"], true);
        assert_eq!(ops[0]["value"]["capabilities"], json!({"drop": ["ALL"]}));
    }

    #[test]
    fn test_existing_capabilities_are_not_merged() {
        let sc = SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_BIND_SERVICE".to_string()]),
                drop: None,
            }),
            ..SecurityContext::default()
        };
        let ops = run(ContainerPath::new(ContainerList::Containers, 0), &container(Some(sc)));

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0]["value"]["capabilities"], json!({"add": ["NET_BIND_SERVICE"]}));
        assert_eq!(ops[0]["value"]["allowPrivilegeEscalation"], false);
    }

    #[test]
    fn test_hardened_container_is_noop() {
        let sc = SecurityContext {
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string()]),
                drop: Some(vec!["ALL".to_string()]),
            }),
            ..SecurityContext::default()
        };
        let ops = run(ContainerPath::new(ContainerList::Containers, 0), &container(Some(sc)));
        assert!(ops.is_empty());
    }
}
