//! Investigation tests against a real container runtime.
//!
//! These tests need Docker (or `ENGINE_CONTAINER_RUNTIME=podman`) and pull
//! `alpine:3.20`, so they are excluded from regular runs.
//!
//! Run with: `cargo test --test investigation -- --ignored`

#[path = "investigation/docker.rs"]
mod docker;
