//! HTTP boundary for the auxiliary services: rate limiting, health and admin
//! endpoints.

pub mod app;
pub mod config;
pub mod context;
pub mod jobs;
pub mod middleware;
