use json_patch::jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::{Pod, PodSecurityContext, SeccompProfile};
use tracing::debug;

use crate::patch::{PatchError, PatchOp, PatchSet};

use super::pod_name;

pub const SECCOMP_RUNTIME_DEFAULT: &str = "RuntimeDefault";

pub fn pod_security_context_pointer() -> PointerBuf {
    PointerBuf::from_tokens(["spec", "securityContext"])
}

/// Completes the pod-level `securityContext`.
///
/// Fields are filled in order: `runAsUser` first, because `runAsGroup`,
/// `runAsNonRoot` and `fsGroup` are derived from whatever user id the pod
/// ends up running as. The whole record is written as one operation, `add`
/// when the pod had no security context and `replace` otherwise. Nothing is
/// appended when every field was already set.
pub fn default_pod_security_context(
    pod: &Pod,
    default_uid: i64,
    patches: &mut PatchSet,
) -> Result<(), PatchError> {
    let existing = pod.spec.as_ref().and_then(|spec| spec.security_context.as_ref());
    let op = PatchOp::for_existing(existing.is_some());
    let mut sc: PodSecurityContext = existing.cloned().unwrap_or_default();
    let mut modified = false;

    let run_as_user = *sc.run_as_user.get_or_insert_with(|| {
        modified = true;
        default_uid
    });

    if sc.run_as_group.is_none() {
        sc.run_as_group = Some(run_as_user);
        modified = true;
    }
    if sc.run_as_non_root.is_none() {
        sc.run_as_non_root = Some(run_as_user != 0);
        modified = true;
    }
    if sc.fs_group.is_none() {
        sc.fs_group = Some(run_as_user);
        modified = true;
    }
    if sc.seccomp_profile.is_none() {
        sc.seccomp_profile = Some(SeccompProfile {
            type_: SECCOMP_RUNTIME_DEFAULT.to_string(),
            ..SeccompProfile::default()
        });
        modified = true;
    }

    if !modified {
        return Ok(());
    }

    debug!(pod = pod_name(pod), op = op.as_str(), "defaulting pod securityContext");
    patches.append(op, pod_security_context_pointer(), &sc)
}
