//! Conda OCI Mirror Library
//!
//! A Rust library for mirroring conda channels into OCI-compatible
//! artifact registries. Every package archive, its extracted metadata,
//! and the channel index become OCI artifacts with stable tags: archives
//! publish under a tag derived from their version and build, and each
//! channel index publishes under a dated immutable tag plus a moving
//! `latest` tag.

pub mod config;
pub mod digest;
pub mod error;
pub mod mirror;
pub mod oci;
pub mod package;
pub mod pusher;
pub mod repo;
pub mod runner;
pub mod tasks;

pub use config::Config;
pub use error::MirrorError;
pub use mirror::{ChannelIndexer, Mirror, DEFAULT_SUBDIRS};
pub use oci::OciRegistry;
pub use package::Package;
pub use pusher::{PushReceipt, Pusher};
pub use repo::{PackageRepo, RepoData};
pub use runner::TaskRunner;
pub use tasks::{RunContext, Task, TaskOutcome};
