//! Tier manager service: configuration, wiring and HTTP API

pub mod api;
pub mod app;
pub mod config;
