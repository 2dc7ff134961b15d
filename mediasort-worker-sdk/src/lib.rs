//! # Mediasort Worker SDK
//!
//! Wire types and HTTP client for mediasort container-plugin workers.
//!
//! ## Overview
//!
//! The mediasort daemon fans metadata-extraction work out to sandboxed
//! worker processes ("container plugins"). This crate is the shared
//! contract between the two sides:
//!
//! - **`protocol`**: request/response bodies for every worker endpoint and
//!   the asynchronous callback that terminates a task
//! - **`client`**: a typed `reqwest` wrapper over `GET /health`,
//!   `GET /manifest`, `POST /configure` and `POST /process`
//! - **`graph`**: topological validation of plugin dependency declarations
//!   over the active set
//! - **`error`**: the `WorkerError` taxonomy the daemon classifies task
//!   outcomes with
//! - **`common`**: serde helpers shared with the daemon's configuration
//!
//! ## The worker contract in one paragraph
//!
//! A worker advertises itself through an immutable [`protocol::PluginManifest`]
//! (priority, default queue tier, dependencies, per-task timeout, file
//! filter). The daemon probes `GET /health` every 30 seconds and only routes
//! to instances reporting `status == "healthy"` and `ready == true`. A task
//! is dispatched with `POST /process`; the worker must answer `accepted`
//! within the dispatch timeout and later POST a
//! [`protocol::CallbackPayload`] to the callback URL. Callbacks for unknown
//! or expired task ids are dropped by the daemon without side effect.
//!
//! ## Example
//!
//! ```rust
//! use mediasort_worker_sdk::{WorkerClient, protocol::ProcessRequest};
//! use std::time::Duration;
//!
//! let client = WorkerClient::new("http://meta-plugin-ffprobe-0:8080")?;
//! let manifest = client.manifest().await?;
//! println!("plugin {} v{}", manifest.id, manifest.version);
//! ```

pub mod client;
pub mod common;
pub mod error;
pub mod graph;
pub mod protocol;

pub use client::WorkerClient;
pub use error::WorkerError;
pub use graph::{activation_order, GraphError};
pub use protocol::{
    CallbackPayload, CallbackStatus, HealthResponse, PluginManifest, ProcessRequest,
    ProcessResponse, QueueKind,
};
