//! Core data models for APSS.
//!
//! This module defines the wire types exchanged between the sidecar agent,
//! the controller, and the Sweet Security relay:
//! - `SecurityEvent`: the unit of telemetry, with exactly one typed payload
//! - `Alert`: a detection rule match over one or more events
//! - `AgentInfo`: per-agent liveness record kept by the controller
//!
//! Field names and enum string forms are part of the external HTTP contract
//! and must not change without versioning the API.

mod alert;
mod event;

pub use alert::{AgentInfo, Alert};
pub use event::{
    EventType, FileEventData, FileOperation, NetworkEventData, ProcessEventData, SecurityEvent,
    Severity,
};
