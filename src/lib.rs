//! Asynchronous job pipeline
//!
//! Offloads slow AI work (try-on image generation, size inference, chat
//! turns) from the storefront request path: submit, durable queue, worker,
//! state transition, push notification, with a polling fallback.

pub mod app_state;
pub mod bootstrap;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod telemetry;
