#![forbid(unsafe_code)]

//! apss-lib: Shared library for APSS common functionality.
//!
//! This library provides core functionality shared across all APSS components:
//! - Core data models for security events, alerts, and agent tracking
//! - Detection engine with a fixed, data-driven rule set
//! - Configuration loading from the environment with defaults
//! - Sweet Security API client for relaying alerts and events

pub mod config;
pub mod detection;
pub mod models;
pub mod sweetsecurity;
