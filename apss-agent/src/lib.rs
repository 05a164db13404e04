#![forbid(unsafe_code)]

//! apss-agent: in-pod security monitoring sidecar.
//!
//! The agent runs three monitors inside the pod's own namespaces and funnels
//! their output through a single event collector:
//! - `procmon`: process starts/exits from the proc virtual filesystem
//! - `netmon`: connections and listeners from the kernel connection tables
//! - `filemon`: file integrity changes via filesystem notifications
//!
//! The collector enriches events with pod identity and forwards them to the
//! controller over HTTP. Everything is bounded; producers never block.

pub mod collector;
pub mod filemon;
pub mod monitor;
pub mod netmon;
pub mod procmon;
