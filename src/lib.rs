//! # dockfleet
//!
//! A control plane for fleets of Docker-compatible container hosts.
//! Operators group nodes into clusters, launch and update containers,
//! stream events and logs, roll image upgrades across a cluster and
//! persist the whole desired state as one declarative document.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      dockfleet control plane                  │
//! │  ┌──────────┐ ┌───────────┐ ┌────────────┐ ┌──────────────┐  │
//! │  │ REST API │ │ Discovery │ │ Registries │ │  Job engine  │  │
//! │  │  (axum)  │ │ (clusters)│ │ nodes/ctrs │ │ + strategies │  │
//! │  └──────────┘ └───────────┘ └────────────┘ └──────────────┘  │
//! │        KV store (file-backed)   ·   in-process event bus      │
//! └───────────────────────────────────────────────────────────────┘
//!             │ Docker remote API (HTTP)
//!    ┌────────┼─────────────┐
//!    ▼        ▼             ▼
//!  node-1   node-2   swarm orchestrator
//! ```
//!
//! The `docker` module is the only place that speaks the daemon wire
//! protocol; everything above it works against the `DockerService`
//! trait, so tests (and plain node groups) substitute other
//! implementations.

pub mod api;
pub mod app;
pub mod batch;
pub mod bus;
pub mod cli;
pub mod config;
pub mod containers;
pub mod discovery;
pub mod docker;
pub mod image;
pub mod jobs;
pub mod kv;
pub mod nodes;
pub mod registry;
pub mod source;
pub mod version;

pub use app::App;
pub use config::AppConfig;
