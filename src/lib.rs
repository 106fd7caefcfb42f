//! defuse - download untrusted documents safely
//!
//! This crate provides:
//! - Sandboxed fetching through firejail, bubblewrap, podman or docker,
//!   with fallback between them
//! - The in-sandbox fetch helper (`defuse-fetch`)
//! - Document format detection
//! - Sanitization through Dangerzone

pub mod config;
pub mod formats;
pub mod paths;
pub mod sandbox;
pub mod sanitizer;

pub use config::Config;
