//! Fleet monitoring dashboard client.
//!
//! Reads devices, telemetry and events from the fleet REST API, keeps them in a
//! polling query cache, and invalidates that cache from the backend's push
//! channel so the dashboard refreshes as soon as something changes.

pub mod app;
pub mod cache;
pub mod config;
pub mod errors;
pub mod markers;
pub mod metrics;
pub mod model;
pub mod push;
pub mod queries;
pub mod rest;
pub mod server;
pub mod sync;
pub mod views;
