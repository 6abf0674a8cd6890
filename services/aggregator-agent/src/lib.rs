//! Aggregator node agent library.
//!
//! The agent runs on each log-aggregation host. It keeps two managed
//! services (a syslog collector and a log shipper) converged to the desired
//! state held by the control plane, and reports liveness with a heartbeat
//! only while every desired service is healthy.
//!
//! ## Architecture
//!
//! ```text
//! control plane ──push──> LiveUpdateChannel ─┐
//!               ──pull──> ConfigSynchronizer ─┴─> DesiredConfig ──intents──> Reconciler
//!                                                                              │
//! monitor loop: HealthMonitor ──> ServiceController <──────────────────────────┘
//!                    │                   │
//!                    └──> heartbeat      └──> ProcessManager (docker compose)
//! ```
//!
//! ## Modules
//!
//! - `agent`: wiring, loops and shutdown
//! - `channel`: push-based live updates over a WebSocket
//! - `sync`: pull-based config sync with retries
//! - `controller`: flag-change and health-driven reconciliation
//! - `process`: process manager interface, compose implementation and mock

pub mod agent;
pub mod backoff;
pub mod channel;
pub mod config;
pub mod controller;
pub mod desired;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod process;
pub mod reconciler;
pub mod render;
pub mod service;
pub mod sync;

// Re-export commonly used types
pub use agent::{Agent, AgentSettings};
pub use config::Config;
pub use desired::{ConfigUpdateMessage, DesiredConfig, UpdateSource};
pub use process::{ComposeProcessManager, MockProcessManager, ProcessManager};
pub use render::TemplateRenderer;
pub use service::ManagedService;
