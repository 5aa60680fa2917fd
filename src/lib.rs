//! Tracegate - a lobby for per-trace debug containers
//!
//! This library implements a lobby process that:
//! - Watches a root directory for recorded debug traces arriving and leaving
//! - Derives a stable URL-safe identifier from each trace's intrinsic UUID
//! - Launches one isolated application container per trace and tears it
//!   down when the trace disappears
//! - Serves the per-trace entry pages with strict security headers,
//!   caching them after one read out of the container
//! - Manages a reverse-proxy sidecar (label-based routing to the
//!   containers) and an authentication stub in front of everything

pub mod auth;
pub mod cache;
pub mod cmd;
pub mod config;
pub mod error;
pub mod ident;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod watcher;
