//! caddyctl - deploy and supervise a Caddy reverse proxy
//!
//! This library manages the lifecycle of a single Caddy instance:
//! - Renders a Caddyfile from typed inputs (listen spec, backend, TLS)
//! - Starts Caddy detached in the background and records its pid
//! - Detects running and orphaned instances via an injected process probe
//! - Stops gracefully, escalating to a hard kill only when needed
//! - Aggregates health from process, config, port, HTTP and TLS probes
//! - Installs the Caddy binary from the latest upstream release

pub mod caddyfile;
pub mod diagnose;
pub mod dns;
pub mod endpoint;
pub mod error;
pub mod health;
pub mod install;
pub mod logs;
pub mod probe;
pub mod supervisor;

/// Version of this crate, reported by the CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
