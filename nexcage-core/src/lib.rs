//! Container lifecycle controller for Proxmox VE.
//!
//! `nexcage-core` turns OCI bundles into running Proxmox LXC containers,
//! VMs, or OCI-runtime sandboxes. It owns four layers:
//!
//! - [`layerfs`] — content-addressed layer storage and overlay mounting.
//! - [`image_converter`] — OCI bundle to Proxmox LXC template conversion.
//! - [`proxmox`] — the Proxmox control client (HTTP API or `pct`/`qm`).
//! - [`backend`], [`router`], [`orchestrator`] — the uniform backend
//!   contract, the name-to-backend routing, and the lifecycle state
//!   machine built on top of it.
//!
//! # Quick start
//!
//! ```no_run
//! use nexcage_core::config;
//!
//! let cfg = config::load(std::path::Path::new("/etc/nexcage/config.json"))
//!     .expect("invalid config");
//! println!("routing to node {}", cfg.proxmox.node);
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod image_converter;
pub mod layerfs;
pub mod orchestrator;
pub mod proxmox;
pub mod router;
pub mod sandbox;
pub mod state;

pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
pub use router::Router;
pub use sandbox::{ContainerType, SandboxConfig};
pub use state::{ContainerState, ContainerStatus};
