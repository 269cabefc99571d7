//! lineq operator: turns WaitingRoom resources into HAProxy ingress routes

#![deny(missing_docs)]

/// lineq backend HTTP client
pub mod backend;
/// Runtime configuration
pub mod config;
/// Watch, queue, workers and reconciler
pub mod controller;
/// Shared HAProxy configuration snippets
pub mod haproxy;
/// Setup, pipeline runs and leadership
pub mod runner;
