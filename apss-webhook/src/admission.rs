//! Sidecar injection logic: skip predicate and JSON Patch construction.

use base64::Engine as _;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info};

use apss_lib::config::WebhookConfig;

use crate::k8s::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, Capabilities, Container,
    EmptyDirVolumeSource, EnvVar, PatchOperation, Pod, ResourceRequirements, SecurityContext,
    Volume, VolumeMount,
};

/// Name of the injected sidecar container.
pub const AGENT_CONTAINER_NAME: &str = "apss-agent";

/// Name of the in-memory scratch volume mounted by the sidecar.
pub const PROC_VOLUME_NAME: &str = "apss-proc";

/// Annotation an operator sets to `"false"` to opt a pod out of injection.
pub const INJECT_ANNOTATION: &str = "apss.invisible.tech/inject";

/// Annotation the webhook sets on successfully patched pods.
pub const INJECTED_ANNOTATION: &str = "apss.invisible.tech/injected";

/// Admission processing errors. These surface as HTTP 400s; everything pod-
/// level is reported inside the AdmissionResponse instead.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("decode admission review: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("admission review has no request")]
    MissingRequest,
}

/// Whether the pod should be admitted without injection.
pub fn should_skip_injection(cfg: &WebhookConfig, pod: &Pod, namespace: &str) -> bool {
    if cfg.exclude_namespaces.iter().any(|ns| ns == namespace) {
        return true;
    }
    if pod
        .spec
        .containers
        .iter()
        .any(|container| container.name == AGENT_CONTAINER_NAME)
    {
        return true;
    }
    if let Some(annotations) = &pod.metadata.annotations {
        if annotations.get(INJECT_ANNOTATION).map(String::as_str) == Some("false") {
            return true;
        }
    }
    if pod.spec.host_network {
        return true;
    }
    false
}

/// JSON Patch operations that inject the sidecar into `pod`.
pub fn create_sidecar_patches(
    cfg: &WebhookConfig,
    pod: &Pod,
) -> Result<Vec<PatchOperation>, serde_json::Error> {
    let mut patches = Vec::new();

    let sidecar = sidecar_container(cfg, pod);
    patches.push(PatchOperation::add(
        "/spec/containers/-",
        serde_json::to_value(&sidecar)?,
    ));

    let proc_volume = Volume {
        name: PROC_VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: "Memory".to_string(),
        }),
    };
    match &pod.spec.volumes {
        None => patches.push(PatchOperation::add(
            "/spec/volumes",
            serde_json::to_value(vec![&proc_volume])?,
        )),
        Some(volumes) if volumes.is_empty() => patches.push(PatchOperation::add(
            "/spec/volumes",
            serde_json::to_value(vec![&proc_volume])?,
        )),
        Some(_) => patches.push(PatchOperation::add(
            "/spec/volumes/-",
            serde_json::to_value(&proc_volume)?,
        )),
    }

    if pod.spec.share_process_namespace != Some(true) {
        patches.push(PatchOperation::add(
            "/spec/shareProcessNamespace",
            Value::Bool(true),
        ));
    }

    match &pod.metadata.annotations {
        None => patches.push(PatchOperation::add(
            "/metadata/annotations",
            json!({ INJECTED_ANNOTATION: "true" }),
        )),
        Some(_) => {
            // "/" in the annotation key must be JSON-Pointer-escaped.
            let escaped = INJECTED_ANNOTATION.replace('/', "~1");
            patches.push(PatchOperation::add(
                format!("/metadata/annotations/{escaped}"),
                Value::String("true".to_string()),
            ));
        }
    }

    Ok(patches)
}

/// The sidecar container definition.
fn sidecar_container(cfg: &WebhookConfig, pod: &Pod) -> Container {
    Container {
        name: AGENT_CONTAINER_NAME.to_string(),
        image: Some(cfg.sidecar_image.clone()),
        resources: Some(ResourceRequirements {
            requests: [
                ("cpu".to_string(), "10m".to_string()),
                ("memory".to_string(), "32Mi".to_string()),
            ]
            .into(),
            limits: [
                ("cpu".to_string(), "100m".to_string()),
                ("memory".to_string(), "128Mi".to_string()),
            ]
            .into(),
        }),
        env: vec![
            EnvVar::field_ref("POD_NAME", "metadata.name"),
            EnvVar::field_ref("POD_NAMESPACE", "metadata.namespace"),
            EnvVar::field_ref("NODE_NAME", "spec.nodeName"),
            EnvVar::literal(
                "AGENT_ID",
                format!("{}-{}", pod.metadata.name, pod.metadata.namespace),
            ),
            EnvVar::literal("CONTROLLER_ENDPOINT", cfg.controller_endpoint.clone()),
        ],
        security_context: Some(SecurityContext {
            run_as_non_root: Some(true),
            read_only_root_filesystem: Some(true),
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: vec!["ALL".to_string()],
            }),
        }),
        volume_mounts: vec![VolumeMount {
            name: PROC_VOLUME_NAME.to_string(),
            mount_path: "/proc".to_string(),
            read_only: true,
        }],
    }
}

/// Decode an AdmissionReview body, apply the webhook logic, and return the
/// serialized response review.
pub fn process_admission_review(
    body: &[u8],
    cfg: &WebhookConfig,
) -> Result<Vec<u8>, AdmissionError> {
    let mut review: AdmissionReview = serde_json::from_slice(body)?;
    let request = review.request.as_ref().ok_or(AdmissionError::MissingRequest)?;

    let mut response = process_request(request, cfg);
    response.uid = request.uid.clone();
    review.response = Some(response);

    Ok(serde_json::to_vec(&review)?)
}

fn process_request(request: &AdmissionRequest, cfg: &WebhookConfig) -> AdmissionResponse {
    if request.kind.kind != "Pod" {
        return AdmissionResponse::allowed();
    }

    let pod: Pod = match serde_json::from_value(request.object.clone()) {
        Ok(pod) => pod,
        Err(err) => {
            error!(error = %err, "failed to decode pod");
            return AdmissionResponse::denied(format!("Failed to unmarshal pod: {err}"));
        }
    };

    debug!(
        pod = %pod.metadata.name,
        namespace = %request.namespace,
        "processing pod admission"
    );

    if should_skip_injection(cfg, &pod, &request.namespace) {
        debug!(
            pod = %pod.metadata.name,
            namespace = %request.namespace,
            "skipping sidecar injection"
        );
        return AdmissionResponse::allowed();
    }

    let patches = match create_sidecar_patches(cfg, &pod) {
        Ok(patches) => patches,
        Err(err) => {
            error!(error = %err, "failed to marshal patches");
            return AdmissionResponse::denied(format!("Failed to marshal patches: {err}"));
        }
    };
    let patch_bytes = match serde_json::to_vec(&patches) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(error = %err, "failed to marshal patches");
            return AdmissionResponse::denied(format!("Failed to marshal patches: {err}"));
        }
    };

    info!(
        pod = %pod.metadata.name,
        namespace = %request.namespace,
        patches = patches.len(),
        "injecting APSS sidecar"
    );

    AdmissionResponse {
        uid: String::new(),
        allowed: true,
        status: None,
        patch: Some(base64::engine::general_purpose::STANDARD.encode(patch_bytes)),
        patch_type: Some("JSONPatch".to_string()),
    }
}
