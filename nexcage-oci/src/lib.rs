//! OCI bundle parsing and content-addressed archive utilities for nexcage.
//!
//! This crate owns the two leaf concerns the rest of nexcage builds on:
//!
//! - digest computation and integrity-checked copies ([`digest`])
//! - multi-codec tar extraction/packing with OCI whiteout handling and
//!   path-escape protection ([`archive`])
//! - OCI Runtime Spec bundle parsing and LXC config derivation ([`bundle`])
//!
//! Images arrive as bundles already present on disk; this crate has no
//! registry client and never speaks an image-pull protocol.

#![allow(clippy::missing_docs_in_private_items)]

pub mod archive;
pub mod bundle;
pub mod digest;
mod error;

pub use archive::{Codec, ExtractReport, extract_archive, pack_archive};
pub use bundle::{
    IMAGE_REF_ANNOTATION, LxcShapeConfig, OciBundle, OciSpec, extract_image_ref, parse_bundle,
    to_lxc_config,
};
pub use digest::{compute_digest, content_digest, copy_with_digest};
pub use error::{Error, Result};
