#![forbid(unsafe_code)]

//! apss-webhook: mutating admission webhook for sidecar injection.
//!
//! Given a pod admission request, the webhook either allows the pod
//! unchanged (excluded namespace, already injected, opted out, or
//! host-network) or returns an RFC 6902 JSON Patch that adds the APSS agent
//! container, its scratch volume, process-namespace sharing, and the
//! injected-marker annotation.

pub mod admission;
pub mod k8s;
pub mod server;
