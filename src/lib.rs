//! Keeps durable project state and leased remote sandboxes consistent.
//!
//! - [`reconcile::StatusLoop`] watches a project's sandbox and triggers a
//!   resync when its lease runs out.
//! - [`sync::FileSync`] and [`sync::VersionHistory`] apply guarded writes and
//!   keep an append-only snapshot history.
//! - [`sync::SyncOrchestrator`] resumes or recreates a sandbox and pushes the
//!   durable files into it.
//! - [`rpc::RpcTransport`] carries call/response traffic to the embedded
//!   preview frame.

pub mod config;
pub mod error;
pub mod model;
pub mod reconcile;
pub mod rpc;
pub mod sandbox;
pub mod store;
pub mod sync;

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use model::{
    ActionRequired, ChangeType, DependencyMap, FileMap, Project, SandboxSession, SandboxStatus,
    StatusCheckResult, VersionSnapshot,
};
