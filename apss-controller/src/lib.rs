#![forbid(unsafe_code)]

//! apss-controller: cluster-wide event collector and detection pipeline.
//!
//! The controller ingests security events from all sidecar agents over HTTP,
//! tracks agent liveness, runs the detection engine over every event, retains
//! a bounded alert history, and relays alerts and high-severity events to the
//! Sweet Security API when configured.

pub mod controller;
pub mod metrics;
pub mod server;
