//! Local inference gateway.
//!
//! Fronts a heterogeneous set of local ML executables (chat completion,
//! speech-to-text, text-to-speech) behind a uniform buffered and streaming
//! HTTP API. Model artifacts are declared in a schema-validated YAML config
//! that hot-reloads, and sidecar server processes are supervised with
//! readiness probing.

pub mod api;
pub mod backend;
pub mod config;
pub mod envvar;
pub mod error;
pub mod logging;
pub mod model;
pub mod params;
pub mod service;
pub mod state;

pub use error::{Error, Result};
